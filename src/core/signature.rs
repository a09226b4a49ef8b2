//! Webhook 签名：HMAC-SHA256，十六进制编码
//!
//! 出站回调附带签名头；入站回调（/callbacks/ingest）在配置了密钥时必须通过校验。

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// 签名器：持有密钥与签名头名称
#[derive(Clone)]
pub struct Signer {
    secret: Vec<u8>,
    header: String,
}

impl Signer {
    pub fn new(secret: impl Into<Vec<u8>>, header: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            header: header.into(),
        }
    }

    /// 密钥为空或未配置时返回 None（即关闭签名）
    pub fn from_config(cfg: &crate::config::CallbackSection) -> Option<Self> {
        cfg.hmac_secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(|s| Self::new(s.as_bytes().to_vec(), cfg.signature_header.clone()))
    }

    pub fn header(&self) -> &str {
        &self.header
    }

    fn mac(&self) -> HmacSha256 {
        // HMAC 接受任意长度密钥
        HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts keys of any length")
    }

    pub fn sign(&self, body: &[u8]) -> String {
        let mut mac = self.mac();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    /// 常数时间比较
    pub fn verify(&self, body: &[u8], signature: &str) -> bool {
        let Ok(expected) = hex::decode(signature.trim()) else {
            return false;
        };
        let mut mac = self.mac();
        mac.update(body);
        mac.verify_slice(&expected).is_ok()
    }
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("header", &self.header)
            .finish_non_exhaustive()
    }
}
