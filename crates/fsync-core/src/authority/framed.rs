//! [`Authority`] over a byte stream, and the matching server loop.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};

use fsync_error::{FsyncError, Result, ServerStatus};
use fsync_types::Handle;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::Authority;
use super::protocol::{CreateRequest, Frame, MessageKind, QueryRequest, Reply, read_frame};

/// Client side of the authority protocol.
///
/// Calls are serialized on the stream; each carries a fresh request id and
/// the reply must echo it.
pub struct FramedAuthority<S> {
    stream: Mutex<S>,
    next_request_id: AtomicU64,
}

impl<S: Read + Write + Send> FramedAuthority<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream: Mutex::new(stream),
            next_request_id: AtomicU64::new(1),
        }
    }

    pub fn into_inner(self) -> S {
        self.stream.into_inner()
    }

    fn call(&self, kind: MessageKind, payload: Vec<u8>) -> Result<Reply> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let bytes = Frame {
            kind,
            request_id,
            payload,
        }
        .encode()?;

        let mut stream = self.stream.lock();
        stream.write_all(&bytes)?;
        stream.flush()?;
        let frame = read_frame(&mut *stream)?
            .ok_or_else(|| FsyncError::protocol("authority closed the connection"))?;
        drop(stream);

        if frame.kind != MessageKind::Reply {
            return Err(FsyncError::protocol(format!(
                "expected {} frame, got {}",
                MessageKind::Reply,
                frame.kind
            )));
        }
        if frame.request_id != request_id {
            return Err(FsyncError::protocol(format!(
                "reply for request {} while waiting for {request_id}",
                frame.request_id
            )));
        }
        let reply = Reply::from_bytes(&frame.payload)
            .ok_or_else(|| FsyncError::protocol("malformed reply payload"))?;
        trace!(
            target: "fsync_core::authority",
            %kind,
            request_id,
            status = %reply.status,
            "authority replied"
        );
        Ok(reply)
    }
}

impl<S: Read + Write + Send> Authority for FramedAuthority<S> {
    fn create_fsync(&self, request: &CreateRequest) -> Result<Reply> {
        self.call(MessageKind::CreateFsync, request.to_bytes()?)
    }

    fn query_object(&self, handle: Handle) -> Result<Reply> {
        self.call(MessageKind::QueryObject, QueryRequest { handle }.to_bytes())
    }
}

impl<S> std::fmt::Debug for FramedAuthority<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedAuthority")
            .field(
                "next_request_id",
                &self.next_request_id.load(Ordering::Relaxed),
            )
            .finish_non_exhaustive()
    }
}

/// Answer requests from one connection until the peer hangs up.
///
/// Malformed request payloads are answered with `InvalidParameter`; framing
/// errors and stray `Reply` frames end the connection with an error. Returns
/// the number of requests served.
pub fn serve_connection<S, A>(mut stream: S, authority: &A) -> Result<u64>
where
    S: Read + Write,
    A: Authority + ?Sized,
{
    let mut served = 0_u64;
    while let Some(frame) = read_frame(&mut stream)? {
        let reply = match frame.kind {
            MessageKind::CreateFsync => match CreateRequest::from_bytes(&frame.payload) {
                Some(request) => authority.create_fsync(&request)?,
                None => {
                    warn!(
                        target: "fsync_core::authority",
                        request_id = frame.request_id,
                        "malformed create request"
                    );
                    Reply::bare(ServerStatus::InvalidParameter)
                }
            },
            MessageKind::QueryObject => match QueryRequest::from_bytes(&frame.payload) {
                Some(query) => authority.query_object(query.handle)?,
                None => Reply::bare(ServerStatus::InvalidHandle),
            },
            MessageKind::Reply => {
                return Err(FsyncError::protocol("client sent a reply frame"));
            }
        };
        let bytes = Frame {
            kind: MessageKind::Reply,
            request_id: frame.request_id,
            payload: reply.to_bytes(),
        }
        .encode()?;
        stream.write_all(&bytes)?;
        stream.flush()?;
        served += 1;
    }
    debug!(target: "fsync_core::authority", served, "authority connection closed");
    Ok(served)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// A canned byte stream: reads from `input`, collects writes.
    struct Script {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Script {
        fn replying(frames: &[Frame]) -> Self {
            let mut input = Vec::new();
            for frame in frames {
                input.extend(frame.encode().unwrap());
            }
            Self {
                input: Cursor::new(input),
                output: Vec::new(),
            }
        }
    }

    impl Read for Script {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Script {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.output.write(buf)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn reply_frame(request_id: u64, reply: Reply) -> Frame {
        Frame {
            kind: MessageKind::Reply,
            request_id,
            payload: reply.to_bytes(),
        }
    }

    #[test]
    fn client_sends_create_and_reads_reply() {
        let answer = Reply::bare(ServerStatus::NotImplemented);
        let client = FramedAuthority::new(Script::replying(&[reply_frame(1, answer)]));
        assert_eq!(
            client.create_fsync(&CreateRequest::support_query()).unwrap(),
            answer
        );

        let sent = client.into_inner().output;
        let frame = Frame::decode(&sent).unwrap();
        assert_eq!(frame.kind, MessageKind::CreateFsync);
        assert_eq!(frame.request_id, 1);
        assert_eq!(
            CreateRequest::from_bytes(&frame.payload),
            Some(CreateRequest::support_query())
        );
    }

    #[test]
    fn mismatched_request_id_is_a_protocol_error() {
        let stale = reply_frame(99, Reply::bare(ServerStatus::Success));
        let client = FramedAuthority::new(Script::replying(&[stale]));
        let err = client.query_object(Handle::new(4).unwrap()).unwrap_err();
        assert!(matches!(err, FsyncError::Protocol { .. }), "{err}");
    }

    #[test]
    fn hang_up_is_a_protocol_error() {
        let client = FramedAuthority::new(Script::replying(&[]));
        let err = client.query_object(Handle::new(4).unwrap()).unwrap_err();
        assert!(matches!(err, FsyncError::Protocol { .. }));
    }

    #[test]
    fn server_answers_malformed_create_with_invalid_parameter() {
        struct Never;
        impl Authority for Never {
            fn create_fsync(&self, _: &CreateRequest) -> Result<Reply> {
                unreachable!("malformed requests never reach the authority")
            }
            fn query_object(&self, _: Handle) -> Result<Reply> {
                unreachable!("no queries are sent")
            }
        }

        let bad = Frame {
            kind: MessageKind::CreateFsync,
            request_id: 5,
            payload: vec![1, 2, 3],
        };
        let mut script = Script::replying(&[bad]);
        assert_eq!(serve_connection(&mut script, &Never).unwrap(), 1);

        let frame = Frame::decode(&script.output).unwrap();
        assert_eq!(frame.request_id, 5);
        assert_eq!(
            Reply::from_bytes(&frame.payload).unwrap().status,
            ServerStatus::InvalidParameter
        );
    }
}
