use crate::Result;

/// 缓存的读写接口。
///
/// 调用方依赖这个 trait 而不是具体的存储类型，
/// 以便替换为分片存储或可注入时钟的测试实现。
pub trait Cache<T> {
    /// 设置指定键的值
    fn set(&self, key: String, value: T) -> Result<()>;

    /// 获取指定键的值
    fn get(&self, key: &str) -> Result<T>;
}
