use {
    crate::{
        ComError, StreamFrame,
        frame::{HEADER_LEN, MAX_MESSAGE_SIZE},
    },
    tokio::io::{AsyncReadExt, AsyncWriteExt},
};

/// Write one tagged frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    frame: &StreamFrame,
) -> Result<(), ComError> {
    let bytes = frame.to_bytes()?;
    writer.write_all(&bytes).await?;
    Ok(())
}

/// Read one tagged frame from an async reader.
///
/// Returns `ComError::ConnectionClosed` if EOF is hit inside the header or payload,
/// and `ComError::MessageTooLarge` if the declared length exceeds `MAX_MESSAGE_SIZE`.
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<StreamFrame, ComError> {
    let mut header = [0u8; HEADER_LEN];
    read_exact_or_closed(reader, &mut header).await?;

    let len = u32::from_le_bytes([header[1], header[2], header[3], header[4]]);
    if len > MAX_MESSAGE_SIZE {
        return Err(ComError::MessageTooLarge(len));
    }

    let mut payload = vec![0u8; len as usize];
    read_exact_or_closed(reader, &mut payload).await?;

    StreamFrame::from_payload(header[0], &payload)
}

/// Read frames until the terminating metrics frame (inclusive).
pub async fn read_until_end<R: AsyncReadExt + Unpin>(
    reader: &mut R,
) -> Result<Vec<StreamFrame>, ComError> {
    let mut frames = Vec::new();
    loop {
        let frame = read_frame(reader).await?;
        let end = frame.is_end();
        frames.push(frame);
        if end {
            return Ok(frames);
        }
    }
}

async fn read_exact_or_closed<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> Result<(), ComError> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(ComError::ConnectionClosed),
        Err(e) => Err(e.into()),
    }
}
