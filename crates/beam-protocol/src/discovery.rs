/// Discovery grammar: plain ASCII datagrams on UDP port 25000.
///
/// The sender broadcasts `SENDER_REQUEST:<filename>:<size>:<key>` and a
/// listening receiver answers the sender's address with the literal
/// `RECEIVER_READY`. Discovery is best-effort and unauthenticated; the real
/// authentication happens in the TCP handshake.

pub const DISCOVERY_PORT: u16 = 25000;
pub const TRANSFER_PORT: u16 = 25001;

pub const SENDER_REQUEST_PREFIX: &str = "SENDER_REQUEST:";
pub const RECEIVER_READY: &str = "RECEIVER_READY";

/// A parsed sender discovery request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderRequest {
    pub filename: String,
    pub size: u64,
    pub key: String,
}

impl SenderRequest {
    pub fn to_line(&self) -> String {
        format!(
            "{}{}:{}:{}",
            SENDER_REQUEST_PREFIX, self.filename, self.size, self.key
        )
    }

    /// Parse a request line. The filename may itself contain colons, so the
    /// size and key are split off the right-hand end.
    pub fn parse(line: &str) -> Option<SenderRequest> {
        let rest = line.strip_prefix(SENDER_REQUEST_PREFIX)?;
        let mut fields = rest.rsplitn(3, ':');
        let key = fields.next()?;
        let size = fields.next()?.parse().ok()?;
        let filename = fields.next()?;
        if filename.is_empty() || key.is_empty() {
            return None;
        }
        Some(SenderRequest {
            filename: filename.to_owned(),
            size,
            key: key.to_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_request() {
        let req = SenderRequest {
            filename: "report.pdf".into(),
            size: 123_456,
            key: "A1B2C3".into(),
        };
        let line = req.to_line();
        assert!(line.starts_with(SENDER_REQUEST_PREFIX));
        assert_eq!(SenderRequest::parse(&line).unwrap(), req);
    }

    #[test]
    fn filename_may_contain_colons() {
        let req = SenderRequest {
            filename: "a:b:c.txt".into(),
            size: 9,
            key: "ZZZZZZ".into(),
        };
        assert_eq!(SenderRequest::parse(&req.to_line()).unwrap(), req);
    }

    #[test]
    fn reject_garbage() {
        assert!(SenderRequest::parse("RECEIVER_READY").is_none());
        assert!(SenderRequest::parse("SENDER_REQUEST:").is_none());
        assert!(SenderRequest::parse("SENDER_REQUEST:file:notanumber:KEY").is_none());
    }
}
