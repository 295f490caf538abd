use {
    crate::ComError,
    base::round_millis,
    serde::{Deserialize, Serialize},
};

pub const TAG_TEXT: u8 = b'T';
pub const TAG_AUDIO: u8 = b'A';
pub const TAG_METRICS: u8 = b'M';

/// Size of the `[tag][u32 length]` frame header.
pub const HEADER_LEN: usize = 5;

pub const MAX_MESSAGE_SIZE: u32 = 64 * 1024 * 1024; // 64 MB

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A piece of transcript with its position on the request timeline, in seconds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TextFragment {
    pub role: Role,
    pub text: String,
    pub start: f64,
    pub end: f64,
}

impl TextFragment {
    /// Offsets are rounded to milliseconds here, so encoding is lossless afterwards.
    pub fn new(role: Role, text: impl Into<String>, start: f64, end: f64) -> Self {
        Self {
            role,
            text: text.into(),
            start: round_millis(start),
            end: round_millis(end),
        }
    }
}

/// First and last activity of one pipeline stage, in seconds since request start.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StageSpan {
    pub first: f64,
    pub last: f64,
}

impl StageSpan {
    pub fn at(t: f64) -> Self {
        Self { first: t, last: t }
    }

    pub fn extend(&mut self, t: f64) {
        self.last = self.last.max(t);
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stt: Option<StageSpan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm: Option<StageSpan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tts: Option<StageSpan>,
    pub total: f64,
}

impl Metrics {
    pub fn time_to_first_token(&self) -> Option<f64> {
        self.llm.map(|span| span.first)
    }

    /// When the first sentence's audio was ready, not when its synthesis
    /// began. The `tts` span marks each sentence as synthesis completes.
    pub fn time_to_first_audio(&self) -> Option<f64> {
        self.tts.map(|span| span.first)
    }
}

/// One unit of the response stream.
///
/// On the wire a frame is `[1-byte tag][u32 little-endian length][payload]`:
/// `T` carries a JSON `TextFragment`, `A` raw little-endian PCM, `M` the final
/// JSON `Metrics` and ends the stream.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamFrame {
    Text(TextFragment),
    Audio(Vec<u8>),
    Metrics(Metrics),
}

impl StreamFrame {
    pub fn tag(&self) -> u8 {
        match self {
            StreamFrame::Text(_) => TAG_TEXT,
            StreamFrame::Audio(_) => TAG_AUDIO,
            StreamFrame::Metrics(_) => TAG_METRICS,
        }
    }

    pub fn is_end(&self) -> bool {
        matches!(self, StreamFrame::Metrics(_))
    }

    pub fn payload(&self) -> Result<Vec<u8>, ComError> {
        Ok(match self {
            StreamFrame::Text(fragment) => serde_json::to_vec(fragment)?,
            StreamFrame::Audio(pcm) => pcm.clone(),
            StreamFrame::Metrics(metrics) => serde_json::to_vec(metrics)?,
        })
    }

    pub fn from_payload(tag: u8, payload: &[u8]) -> Result<Self, ComError> {
        match tag {
            TAG_TEXT => Ok(StreamFrame::Text(serde_json::from_slice(payload)?)),
            TAG_AUDIO => Ok(StreamFrame::Audio(payload.to_vec())),
            TAG_METRICS => Ok(StreamFrame::Metrics(serde_json::from_slice(payload)?)),
            other => Err(ComError::UnknownTag(other)),
        }
    }

    /// Append the encoded frame to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), ComError> {
        let payload = self.payload()?;
        let len = u32::try_from(payload.len()).map_err(|_| ComError::MessageTooLarge(u32::MAX))?;
        if len > MAX_MESSAGE_SIZE {
            return Err(ComError::MessageTooLarge(len));
        }
        buf.reserve(HEADER_LEN + payload.len());
        buf.push(self.tag());
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&payload);
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ComError> {
        let mut buf = Vec::new();
        self.encode(&mut buf)?;
        Ok(buf)
    }

    /// Decode one frame from the front of `buf`, returning it with the number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), ComError> {
        if buf.len() < HEADER_LEN {
            return Err(ComError::Truncated);
        }
        let tag = buf[0];
        let len = u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]);
        if len > MAX_MESSAGE_SIZE {
            return Err(ComError::MessageTooLarge(len));
        }
        let end = HEADER_LEN + len as usize;
        if buf.len() < end {
            return Err(ComError::Truncated);
        }
        Ok((Self::from_payload(tag, &buf[HEADER_LEN..end])?, end))
    }
}

/// Splits a concatenated frame stream back into frames.
pub fn decode_all(mut buf: &[u8]) -> Result<Vec<StreamFrame>, ComError> {
    let mut frames = Vec::new();
    while !buf.is_empty() {
        let (frame, used) = StreamFrame::decode(buf)?;
        frames.push(frame);
        buf = &buf[used..];
    }
    Ok(frames)
}

/// Convert 16-bit samples into the little-endian byte layout of an `A` frame.
pub fn pcm_to_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Inverse of `pcm_to_bytes`; a trailing odd byte is ignored.
pub fn bytes_to_pcm(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect()
}
