use crate::store::ObjectKind;

/// Builds the absolute URLs the server publishes: directory endpoints,
/// stored-object locations and the effective URL of incoming requests.
#[derive(Debug, Clone)]
pub struct UrlMap {
    origin: String,
    base: String,
    path_prefix: String,
}

impl UrlMap {
    pub fn new(host: &str, port: u16, base_path: &str) -> Self {
        let origin = match port {
            80 => format!("http://{host}"),
            443 => format!("https://{host}"),
            _ => format!("http://{host}:{port}"),
        };
        Self {
            base: format!("{origin}{base_path}"),
            origin,
            path_prefix: base_path.to_string(),
        }
    }

    /// Scheme and authority, without the path prefix.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Root under which every endpoint lives.
    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn path_prefix(&self) -> &str {
        &self.path_prefix
    }

    pub fn endpoint(&self, name: &str) -> String {
        format!("{}/{name}", self.base)
    }

    pub fn object(&self, kind: ObjectKind, id: &str) -> String {
        format!("{}/{}/{id}", self.base, kind.tag())
    }

    /// Absolute URL of an incoming request, for protected-header
    /// comparison. `path` is the full request path including any prefix.
    pub fn request(&self, path: &str) -> String {
        format!("{}{path}", self.origin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ports_drop_the_port() {
        assert_eq!(UrlMap::new("example.com", 80, "").base(), "http://example.com");
        assert_eq!(UrlMap::new("example.com", 443, "").base(), "https://example.com");
        assert_eq!(
            UrlMap::new("example.com", 4000, "").base(),
            "http://example.com:4000"
        );
    }

    #[test]
    fn test_base_path_is_appended() {
        let urls = UrlMap::new("example.com", 4000, "/acme");
        assert_eq!(urls.base(), "http://example.com:4000/acme");
        assert_eq!(urls.endpoint("new-nonce"), "http://example.com:4000/acme/new-nonce");
        assert_eq!(
            urls.object(ObjectKind::Registration, "ab12"),
            "http://example.com:4000/acme/reg/ab12"
        );
    }

    #[test]
    fn test_request_url_uses_origin() {
        let urls = UrlMap::new("example.com", 4000, "/acme");
        assert_eq!(
            urls.request("/acme/new-acct"),
            "http://example.com:4000/acme/new-acct"
        );
    }
}
