//! 通用工具函数

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use serde::Serializer;

use crate::error::{PacsError, Result};

/// 标识符最大长度
pub const MAX_IDENTIFIER_LEN: usize = 128;

/// 验证上游标识符格式
///
/// Orthanc的ID（如 `e38b2cea-2661291f-46d12e11-02438677-890941a4`）和DICOM UID都满足该规则。
/// 标识符会被拼接进上游URL路径，因此只允许字母数字、`-`、`.` 和 `_`。
pub fn is_valid_identifier(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_IDENTIFIER_LEN
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_')
}

/// 验证标识符，失败时返回请求格式错误
pub fn validate_identifier(kind: &str, id: &str) -> Result<()> {
    if is_valid_identifier(id) {
        Ok(())
    } else {
        Err(PacsError::MalformedRequest(format!("invalid {}: {:?}", kind, id)))
    }
}

/// 将影像数据编码为base64
pub fn encode_payload(payload: &[u8]) -> String {
    STANDARD.encode(payload)
}

/// 序列化 `Option<Bytes>` 为base64字符串
pub fn serialize_base64<S>(payload: &Option<Bytes>, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match payload {
        Some(bytes) => serializer.serialize_str(&encode_payload(bytes)),
        None => serializer.serialize_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_valid_identifier() {
        assert!(is_valid_identifier("e38b2cea-2661291f-46d12e11-02438677-890941a4"));
        assert!(is_valid_identifier("1.2.840.10008.5.1.4.1.1.4"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier(".."));
        assert!(!is_valid_identifier("../instances"));
        assert!(!is_valid_identifier("abc?x=1"));
        assert!(!is_valid_identifier(&"a".repeat(MAX_IDENTIFIER_LEN + 1)));
    }

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("studyId", "abc-123").is_ok());
        let err = validate_identifier("studyId", "a/b").unwrap_err();
        assert_eq!(err.kind(), "malformed_request");
    }

    #[test]
    fn test_encode_payload() {
        assert_eq!(encode_payload(b"hello"), "aGVsbG8=");
        assert_eq!(encode_payload(b""), "");
    }
}
