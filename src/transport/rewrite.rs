//! The one-shot HTTP Host-header rewrite applied to proxied requests.
//!
//! When the tunnel targets an arbitrary internal host, virtual-host routing on
//! the local server needs the `Host:` header to name that host; when it
//! targets a loopback service the original header is already valid and the
//! stream passes through untouched. The rewrite fires at most once per bridge
//! and matches within a single chunk only, so a header split across TCP reads
//! is passed through unmodified.

use {lazy_static::lazy_static, regex::bytes::Regex};

lazy_static! {
    static ref HOST_HEADER: Regex =
        Regex::new(r"\r\nHost: (\S+)").expect("Host header pattern is valid");
}

/// A stateful stream stage replacing the first `Host:` value it sees.
pub struct HostHeaderRewriter {
    replacement: Vec<u8>,
    replaced: bool,
}

impl HostHeaderRewriter {
    pub fn new(local_address: &str) -> Self {
        HostHeaderRewriter {
            replacement: local_address.as_bytes().to_vec(),
            replaced: false,
        }
    }

    /// Whether rewriting applies when targeting the given local address.
    pub fn applies_to(local_address: &str) -> bool {
        local_address != "localhost"
    }

    /// Pass one chunk through the stage, rewriting the first `Host:` value if
    /// it has not fired yet.
    pub fn apply(&mut self, chunk: Vec<u8>) -> Vec<u8> {
        if self.replaced {
            return chunk;
        }

        let value = match HOST_HEADER.captures(&chunk).and_then(|captures| captures.get(1)) {
            Some(value) => value.range(),
            None => return chunk,
        };
        self.replaced = true;

        let mut rewritten =
            Vec::with_capacity(chunk.len() - value.len() + self.replacement.len());
        rewritten.extend_from_slice(&chunk[..value.start]);
        rewritten.extend_from_slice(&self.replacement);
        rewritten.extend_from_slice(&chunk[value.end..]);
        rewritten
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUEST: &[u8] = b"GET / HTTP/1.1\r\nHost: public.example\r\n\r\n";

    #[test]
    fn rewrites_host_value_once() {
        let mut rewriter = HostHeaderRewriter::new("internal.svc");
        assert_eq!(
            rewriter.apply(REQUEST.to_vec()),
            b"GET / HTTP/1.1\r\nHost: internal.svc\r\n\r\n".to_vec()
        );
        // A second request on the same bridge is left alone.
        assert_eq!(rewriter.apply(REQUEST.to_vec()), REQUEST.to_vec());
    }

    #[test]
    fn chunk_without_host_does_not_consume_the_shot() {
        let mut rewriter = HostHeaderRewriter::new("internal.svc");
        let preamble = b"POST /submit HTTP/1.1".to_vec();
        assert_eq!(rewriter.apply(preamble.clone()), preamble);
        // The next chunk still gets the rewrite.
        assert_eq!(
            rewriter.apply(b"\r\nHost: public.example\r\n\r\n".to_vec()),
            b"\r\nHost: internal.svc\r\n\r\n".to_vec()
        );
    }

    #[test]
    fn rewrite_preserves_surrounding_bytes() {
        let mut rewriter = HostHeaderRewriter::new("10.0.0.7");
        let request =
            b"GET /health HTTP/1.1\r\nHost: edge.example:443\r\nAccept: */*\r\n\r\nbody".to_vec();
        assert_eq!(
            rewriter.apply(request),
            b"GET /health HTTP/1.1\r\nHost: 10.0.0.7\r\nAccept: */*\r\n\r\nbody".to_vec()
        );
    }

    #[test]
    fn loopback_targets_skip_the_stage() {
        assert!(!HostHeaderRewriter::applies_to("localhost"));
        assert!(HostHeaderRewriter::applies_to("internal.svc"));
        assert!(HostHeaderRewriter::applies_to("127.0.0.1"));
    }

    #[test]
    fn header_split_across_chunks_is_left_alone() {
        let mut rewriter = HostHeaderRewriter::new("internal.svc");
        let first = b"GET / HTTP/1.1\r\nHo".to_vec();
        let second = b"st: public.example\r\n\r\n".to_vec();
        assert_eq!(rewriter.apply(first.clone()), first);
        assert_eq!(rewriter.apply(second.clone()), second);
    }
}
