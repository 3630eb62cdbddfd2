use serde::Serialize;

/// Entry of the static model catalog. Immutable after startup, shared
/// lock-free between requests.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct ModelInfo {
    pub id: &'static str,
    pub object: &'static str,
    pub created: i64,
    pub owned_by: &'static str,
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct ModelList {
    pub object: &'static str,
    pub data: &'static [ModelInfo],
}

pub static MODELS: &[ModelInfo] = &[
    ModelInfo {
        id: "gpt-4",
        object: "model",
        created: 1687882411,
        owned_by: "openai",
    },
    ModelInfo {
        id: "gpt-4-turbo",
        object: "model",
        created: 1712361441,
        owned_by: "openai",
    },
    ModelInfo {
        id: "gpt-4-turbo-preview",
        object: "model",
        created: 1706037777,
        owned_by: "openai",
    },
    ModelInfo {
        id: "gpt-4o",
        object: "model",
        created: 1715367049,
        owned_by: "openai",
    },
    ModelInfo {
        id: "gpt-4o-mini",
        object: "model",
        created: 1721172741,
        owned_by: "openai",
    },
    ModelInfo {
        id: "gpt-3.5-turbo",
        object: "model",
        created: 1677610602,
        owned_by: "openai",
    },
    ModelInfo {
        id: "gpt-3.5-turbo-16k",
        object: "model",
        created: 1683758102,
        owned_by: "openai",
    },
    ModelInfo {
        id: "text-embedding-ada-002",
        object: "model",
        created: 1671217299,
        owned_by: "openai-internal",
    },
    ModelInfo {
        id: "text-embedding-3-small",
        object: "model",
        created: 1705948997,
        owned_by: "openai",
    },
    ModelInfo {
        id: "text-embedding-3-large",
        object: "model",
        created: 1705953180,
        owned_by: "openai",
    },
];

pub fn all() -> ModelList {
    ModelList {
        object: "list",
        data: MODELS,
    }
}

pub fn find(id: &str) -> Option<&'static ModelInfo> {
    MODELS.iter().find(|model| model.id == id)
}

/// Embedding dimensionality is fixed per model. Only the v3 models honor a
/// requested override.
pub fn embedding_dimensions(model: &str, requested: Option<usize>) -> usize {
    match model {
        "text-embedding-3-large" => requested.unwrap_or(3072),
        "text-embedding-3-small" => requested.unwrap_or(1536),
        _ => 1536,
    }
}

#[test]
fn lookup() {
    assert!(find("gpt-4o").is_some());
    assert!(find("gpt-5").is_none());
}

#[test]
fn dimensions() {
    assert_eq!(embedding_dimensions("text-embedding-ada-002", None), 1536);
    assert_eq!(embedding_dimensions("text-embedding-3-large", None), 3072);
    assert_eq!(
        embedding_dimensions("text-embedding-3-small", Some(256)),
        256
    );
    // Only v3 models support custom dimensions.
    assert_eq!(
        embedding_dimensions("text-embedding-ada-002", Some(256)),
        1536
    );
}
