use thiserror::Error;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sled 错误 / sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("序列化错误 / serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("未找到记录 / record not found: {0}")]
    NotFound(String),
    #[error("记录已存在（只追加）/ record already exists (append-only): {0}")]
    Conflict(String),
    #[error("事务错误 / transaction error: {0}")]
    Tx(String),
}

/// 获取详细错误描述（中英文） / Get detailed error description (CN/EN)
pub fn describe_error(e: &StoreError) -> String {
    match e {
        StoreError::Sled(err) => format!("存储引擎错误 / Storage engine error: {}", err),
        StoreError::Serde(err) => format!("序列化错误 / Serialization error: {}", err),
        StoreError::NotFound(what) => format!("未找到记录 / Record not found: {}", what),
        StoreError::Conflict(what) => format!("重复写入 / Duplicate write: {}", what),
        StoreError::Tx(msg) => format!("事务错误 / Transaction error: {}", msg),
    }
}
