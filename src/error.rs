use std::fmt;

/// 存储操作可能返回的错误。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// 键从未被设置、已过期或已被移除
    NotFound,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::NotFound => "data not found by this key".fmt(f),
        }
    }
}

impl std::error::Error for Error {}
