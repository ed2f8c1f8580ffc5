//! 摘要计算相关

use md5::{Digest as _, Md5};
use sha2::Sha256;

/// 计算 md5 并编码为小写 hex
pub fn md5_hex(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// 计算 sha256 并编码为小写 hex
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// 流式 md5 计算器，分片数据到达多少算多少
pub struct Md5Summer {
    hasher: Md5,
}

impl Md5Summer {
    pub fn new() -> Self {
        Self { hasher: Md5::new() }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn finish(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

impl Default for Md5Summer {
    fn default() -> Self {
        Self::new()
    }
}

/// 解析 "md5:HEX" 形式的摘要声明，没有前缀时视为裸 md5 hex
pub fn parse_md5(digest: &str) -> Option<&str> {
    if digest.is_empty() {
        return None;
    }
    match digest.split_once(':') {
        Some(("md5", hexstr)) => Some(hexstr),
        Some(_) => None,
        None => Some(digest),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_md5_known_vector() {
        assert_eq!(md5_hex(b"abc"), "900150983cd24fb0d6963f7d28e17f72");
        assert_eq!(
            md5_hex(b"hello world\n"),
            "6f5902ac237024bdd0c176cb93063dc4"
        );
    }

    #[test]
    fn test_md5_summer_matches_oneshot() {
        let mut summer = Md5Summer::new();
        summer.update(b"hello ");
        summer.update(b"world\n");
        assert_eq!(summer.finish(), md5_hex(b"hello world\n"));
    }

    #[test]
    fn test_parse_md5() {
        assert_eq!(parse_md5("md5:abcd"), Some("abcd"));
        assert_eq!(parse_md5("abcd"), Some("abcd"));
        assert_eq!(parse_md5("sha256:abcd"), None);
        assert_eq!(parse_md5(""), None);
    }
}
