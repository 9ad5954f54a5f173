//! Proxy links printed at startup

use serde::Serialize;
use std::fmt::Display;

use crate::core::secret::Secret;
use crate::transport::PublicAddress;

/// Links for one public address
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxyLinks {
    pub tg_url: String,
    pub tme_url: String,
}

impl ProxyLinks {
    fn new(server: impl Display, port: u16, secret: &str) -> Self {
        let query = format!("server={}&port={}&secret={}", server, port, secret);
        Self {
            tg_url: format!("tg://proxy?{}", query),
            tme_url: format!("https://t.me/proxy?{}", query),
        }
    }
}

/// Everything a proxy owner needs to hand out or register the proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<ProxyLinks>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<ProxyLinks>,
    /// Bare key, the form @MTProxybot asks for
    pub secret_for_mtproxybot: String,
}

impl LinkReport {
    pub fn new(secret: &Secret, public: &PublicAddress, port: u16) -> Self {
        let client_secret = secret.to_hex();
        Self {
            ipv4: public.ipv4.map(|ip| ProxyLinks::new(ip, port, &client_secret)),
            ipv6: public.ipv6.map(|ip| ProxyLinks::new(ip, port, &client_secret)),
            secret_for_mtproxybot: hex::encode(secret.key),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 16] = [0xab; 16];

    #[test]
    fn test_links_for_tls_secret() {
        let public = PublicAddress {
            ipv4: Some("203.0.113.5".parse().unwrap()),
            ipv6: None,
        };
        let report = LinkReport::new(&Secret::tls(KEY, "example.com"), &public, 443);
        let links = report.ipv4.as_ref().unwrap();
        let secret = format!("ee{}{}", "ab".repeat(16), hex::encode("example.com"));
        assert_eq!(
            links.tg_url,
            format!("tg://proxy?server=203.0.113.5&port=443&secret={}", secret)
        );
        assert_eq!(
            links.tme_url,
            format!("https://t.me/proxy?server=203.0.113.5&port=443&secret={}", secret)
        );
        assert!(report.ipv6.is_none());
        assert_eq!(report.secret_for_mtproxybot, "ab".repeat(16));
    }

    #[test]
    fn test_json_skips_missing_family() {
        let public = PublicAddress {
            ipv4: None,
            ipv6: Some("2001:db8::5".parse().unwrap()),
        };
        let report = LinkReport::new(&Secret::secure(KEY), &public, 8443);
        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();

        assert!(json.get("ipv4").is_none());
        assert_eq!(
            json["ipv6"]["tg_url"],
            format!("tg://proxy?server=2001:db8::5&port=8443&secret=dd{}", "ab".repeat(16))
        );
        assert_eq!(json["secret_for_mtproxybot"], "ab".repeat(16));
    }
}
