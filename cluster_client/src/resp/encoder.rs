//! RESP command encoder.
//!
//! Commands are always encoded as RESP2 arrays of blob strings, because
//! Redis-compatible servers accept this inline form regardless of the
//! protocol version negotiated via `HELLO`. Builds into an owned buffer
//! rather than writing straight to a stream, so the node connection
//! controls write timing (needed for pipelining).

/// Encodes a single command (its argument vector) as a RESP2 array of
/// blob strings: `*N\r\n$len1\r\n<arg1>\r\n...$lenN\r\n<argN>\r\n`.
pub fn encode_command(args: &[impl AsRef<[u8]>]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        let bytes = arg.as_ref();
        out.extend_from_slice(format!("${}\r\n", bytes.len()).as_bytes());
        out.extend_from_slice(bytes);
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Encodes and concatenates several commands in order, for pipelining.
pub fn encode_pipeline<A: AsRef<[u8]>>(commands: &[Vec<A>]) -> Vec<u8> {
    let mut out = Vec::new();
    for cmd in commands {
        out.extend_from_slice(&encode_command(cmd));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test01_encode_get() {
        let cmd = vec!["GET".to_string(), "foo".to_string()];
        assert_eq!(encode_command(&cmd), b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n".to_vec());
    }

    #[test]
    fn test02_encode_pipeline_concatenates() {
        let cmds: Vec<Vec<String>> = vec![
            vec!["INCR".to_string(), "x".to_string()],
            vec!["INCR".to_string(), "x".to_string()],
        ];
        let encoded = encode_pipeline(&cmds);
        let single = encode_command(&cmds[0]);
        assert_eq!(encoded.len(), single.len() * 2);
    }
}
