use serde::{Deserialize, Serialize};

/// The two language-model engine families.
///
/// `Ollama` is the tag-style engine with its own allocator; `Vllm` is the
/// completion-style engine that runs in a container and takes a GPU memory fraction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    Ollama,
    Vllm,
}

impl Engine {
    pub const ALL: [Engine; 2] = [Engine::Ollama, Engine::Vllm];

    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Ollama => "ollama",
            Engine::Vllm => "vllm",
        }
    }

    /// Loadout prefix selecting this engine, e.g. `OL_llama3`.
    pub fn prefix(&self) -> &'static str {
        match self {
            Engine::Ollama => "OL_",
            Engine::Vllm => "VL_",
        }
    }

    /// Whether the engine accepts a GPU memory-utilization fraction.
    pub fn takes_memory_fraction(&self) -> bool {
        matches!(self, Engine::Vllm)
    }

    pub fn parse(name: &str) -> Option<Engine> {
        match name.trim().to_ascii_lowercase().as_str() {
            "ollama" => Some(Engine::Ollama),
            "vllm" => Some(Engine::Vllm),
            _ => None,
        }
    }
}

impl std::fmt::Display for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
