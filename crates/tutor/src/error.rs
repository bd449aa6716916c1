use thiserror::Error;

/// Failures talking to the generative-model provider.
#[derive(Debug, Error)]
pub enum TutorError {
    #[error("AI provider is not configured")]
    NotConfigured,

    #[error("AI provider request failed: {0}")]
    Transport(String),

    #[error("AI provider error (HTTP {status}): {message}")]
    Vendor { status: u16, message: String },

    #[error("AI provider returned an unexpected response: {0}")]
    InvalidResponse(String),

    #[error("AI tool call was not usable: {0}")]
    InvalidToolCall(String),
}

impl TutorError {
    /// HTTP status the server should answer with.
    ///
    /// Vendor rejections keep their meaning (bad request, no permission,
    /// unknown model or file, payload too large); everything else is a 500.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Vendor { status, .. } => match *status {
                400 => 400,
                401 | 403 => 403,
                404 => 404,
                413 => 413,
                _ => 500,
            },
            _ => 500,
        }
    }
}

impl From<reqwest::Error> for TutorError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            return Self::Vendor {
                status: status.as_u16(),
                message: e.to_string(),
            };
        }
        Self::Transport(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_statuses_map_to_client_facing_codes() {
        let vendor = |status| TutorError::Vendor {
            status,
            message: String::new(),
        };
        assert_eq!(vendor(401).http_status(), 403);
        assert_eq!(vendor(403).http_status(), 403);
        assert_eq!(vendor(404).http_status(), 404);
        assert_eq!(vendor(413).http_status(), 413);
        assert_eq!(vendor(429).http_status(), 500);
        assert_eq!(vendor(503).http_status(), 500);
        assert_eq!(TutorError::NotConfigured.http_status(), 500);
    }
}
