//! Asynchronous client side libvirt RPC library.
//!
//! # Protocol
//! libvirt remote protocol, version 1

use {
    crate::{
        error::{self, Error},
        packet::{
            self, DomainEvent, Header, PacketStatus, PacketType, Response, HEADER_SIZE,
            PROGRAM_QEMU, QEMU_PROC_CONNECT_DOMAIN_MONITOR_EVENT_DEREGISTER,
            QEMU_PROC_DOMAIN_MONITOR_EVENT, STREAM_CHUNK_MAX,
        },
        utils::{Endpoint, Result},
        xdr::{self, XdrDecode, XdrEncode},
    },
    bytes::{Buf, BufMut, Bytes, BytesMut},
    futures::sink::SinkExt,
    log::{debug, error, info, warn},
    std::{
        collections::HashMap,
        io,
        sync::{
            atomic::{AtomicU32, Ordering},
            Arc, Mutex as StdMutex,
        },
    },
    tokio::{
        io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
        net::{TcpStream, UnixStream},
        sync::{mpsc, oneshot, Mutex},
    },
    tokio_stream::StreamExt,
    tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec},
};

type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Byte source feeding the outgoing half of a streaming call.
pub type UploadSource = Box<dyn AsyncRead + Send + Unpin>;

/// Byte sink receiving the incoming half of a streaming call.
pub type DownloadSink<'a> = &'a mut (dyn AsyncWrite + Send + Unpin);

/// Shared state between the public handle, the reader task and stream
/// sender tasks.
struct Inner {
    /// Framed write half; one packet per lock acquisition
    writer: Mutex<FramedWrite<BoxWriter, LengthDelimitedCodec>>,

    /// In-flight calls by serial. Held only across map operations, so a
    /// plain mutex suffices even on the reader task.
    calls: StdMutex<HashMap<u32, mpsc::UnboundedSender<Response>>>,

    /// Event subscriptions by server-assigned callback id
    events: StdMutex<HashMap<u32, mpsc::UnboundedSender<DomainEvent>>>,

    /// Last serial handed out
    serial: AtomicU32,
}

impl Inner {
    /// Create the response channel for a call and install its sender.
    ///
    /// Must happen before the call packet hits the wire, or the reply
    /// could race the registration.
    fn register(&self, serial: u32) -> mpsc::UnboundedReceiver<Response> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(serial, tx);
        rx
    }

    /// Destroy a call's response channel.
    fn deregister(&self, serial: u32) {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&serial);
    }

    /// Hand a response to whichever call owns the serial.
    fn deliver(&self, serial: u32, res: Response) {
        let sink = self
            .calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&serial)
            .cloned();
        match sink {
            // The owning call may have abandoned its receiver already; a
            // failed send is swallowed rather than stalling the reader.
            Some(sink) => {
                let _ = sink.send(res);
            }
            None => debug!("no owner for serial {}, dropping packet", serial),
        }
    }

    /// Decode a domain event and route it to its subscription.
    fn dispatch_event(&self, payload: &[u8]) {
        let event: DomainEvent = match xdr::from_bytes(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!("dropping malformed domain event: {}", e);
                return;
            }
        };

        let sink = self
            .events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&event.callback_id)
            .cloned();
        match sink {
            Some(sink) => {
                let _ = sink.send(event);
            }
            None => debug!("no subscription for callback {}, dropping event", event.callback_id),
        }
    }

    /// Write one packet: header, payload, flush, all under the writer lock
    /// so packets never interleave on the wire.
    async fn send_packet(&self, header: Header, payload: &[u8]) -> Result<()> {
        let mut writer = BytesMut::with_capacity(HEADER_SIZE + payload.len()).writer();
        header.write_xdr(&mut writer)?;
        let mut buf = writer.into_inner();
        buf.extend_from_slice(payload);

        let mut framedwrite = self.writer.lock().await;
        framedwrite.send(buf.freeze()).await?;
        Ok(())
    }
}

/// Handle to one libvirt RPC connection.
///
/// Cheap to clone; all clones share the connection, and any number of
/// calls may be in flight at once. Procedure payloads are opaque
/// XDR-encoded bytes supplied by the caller.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    /// Wrap an already-connected read/write pair and start the reader
    /// task.
    ///
    /// The transport neither establishes nor authenticates the channel;
    /// it only assumes the pair is reliable and ordered.
    pub fn new<R, W>(reader: R, writer: W) -> Client
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let framedread = FramedRead::new(Box::new(reader) as BoxReader, packet::codec());
        let framedwrite = FramedWrite::new(Box::new(writer) as BoxWriter, packet::codec());

        let inner = Arc::new(Inner {
            writer: Mutex::new(framedwrite),
            calls: StdMutex::new(HashMap::new()),
            events: StdMutex::new(HashMap::new()),
            serial: AtomicU32::new(0),
        });

        tokio::spawn(listen(framedread, inner.clone()));

        Client { inner }
    }

    /// Dial a libvirt daemon and wrap the connection.
    ///
    /// The address uses the `proto!address!port` form, e.g.
    /// `unix!/var/run/libvirt/libvirt-sock!0` or `tcp!localhost!16509`.
    pub async fn connect(addr: &str) -> Result<Client> {
        match Endpoint::parse(addr) {
            Some(Endpoint::Tcp(host, port)) => {
                let stream = TcpStream::connect(format!("{}:{}", host, port)).await?;
                let (readhalf, writehalf) = stream.into_split();
                Ok(Client::new(readhalf, writehalf))
            }
            Some(Endpoint::Unix(path)) => {
                let stream = UnixStream::connect(path).await?;
                let (readhalf, writehalf) = stream.into_split();
                Ok(Client::new(readhalf, writehalf))
            }
            None => Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unrecognized endpoint address",
            ))),
        }
    }

    /// Next sequential request serial.
    fn serial(&self) -> u32 {
        self.inner.serial.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    /// Perform a unary RPC request.
    ///
    /// Sends `payload` to the given procedure and returns the reply
    /// payload. A reply with error status is decoded and returned as the
    /// mapped [`Error`].
    pub async fn request(&self, program: u32, procedure: u32, payload: &[u8]) -> Result<Bytes> {
        self.request_stream(program, procedure, payload, None, None)
            .await
    }

    /// Perform an RPC request with attached data streams.
    ///
    /// `upload`, when present, is drained concurrently and sent to the
    /// server as stream packets after the initial reply. `download`, when
    /// present, receives the payload of every incoming stream packet.
    /// Either, both, or neither may be supplied; with neither this is
    /// [`request`](Self::request).
    pub async fn request_stream(
        &self,
        program: u32,
        procedure: u32,
        payload: &[u8],
        upload: Option<UploadSource>,
        download: Option<DownloadSink<'_>>,
    ) -> Result<Bytes> {
        let serial = self.serial();
        let rx = self.inner.register(serial);

        let res = self
            .call(serial, program, procedure, payload, upload, download, rx)
            .await;
        self.inner.deregister(serial);
        res
    }

    #[allow(clippy::too_many_arguments)]
    async fn call(
        &self,
        serial: u32,
        program: u32,
        procedure: u32,
        payload: &[u8],
        upload: Option<UploadSource>,
        download: Option<DownloadSink<'_>>,
        mut rx: mpsc::UnboundedReceiver<Response>,
    ) -> Result<Bytes> {
        self.inner
            .send_packet(
                Header::new(program, procedure, PacketType::Call, serial, PacketStatus::Ok),
                payload,
            )
            .await?;

        let first = get_response(&mut rx).await?;

        if let Some(source) = upload {
            let (abort_tx, abort_rx) = oneshot::channel();
            let sender = tokio::spawn(send_stream(
                self.inner.clone(),
                serial,
                program,
                procedure,
                source,
                abort_rx,
            ));

            // The server confirms the upload on the reply channel even
            // when no reverse stream exists.
            match process_download(&mut rx, download).await {
                Ok(last) => {
                    sender.await.map_err(io::Error::other)??;
                    Ok(last.payload)
                }
                Err(e) => {
                    let _ = abort_tx.send(());
                    let _ = sender.await;
                    Err(e)
                }
            }
        } else if download.is_some() {
            let last = process_download(&mut rx, download).await?;
            Ok(last.payload)
        } else {
            Ok(first.payload)
        }
    }

    /// Route domain monitor events carrying `callback_id` into `sink`.
    ///
    /// The callback id is assigned by the server when the subscription
    /// RPC is made; the transport only maintains the routing table.
    pub fn subscribe(&self, callback_id: u32, sink: mpsc::UnboundedSender<DomainEvent>) {
        self.inner
            .events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(callback_id, sink);
    }

    /// Stop routing events for `callback_id` and tell the server to stop
    /// emitting them.
    ///
    /// The routing entry goes first, so nothing is delivered to the sink
    /// once this returns, whatever the server does in the meantime.
    pub async fn unsubscribe(&self, callback_id: u32) -> Result<()> {
        self.inner
            .events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&callback_id);

        let payload = xdr::to_bytes(&callback_id)?;
        self.request(
            PROGRAM_QEMU,
            QEMU_PROC_CONNECT_DOMAIN_MONITOR_EVENT_DEREGISTER,
            &payload,
        )
        .await?;
        Ok(())
    }

    /// Close the write half of the connection.
    ///
    /// The reader task exits once the server hangs up in response, which
    /// fails any call still in flight.
    pub async fn shutdown(&self) -> Result<()> {
        let mut framedwrite = self.inner.writer.lock().await;
        framedwrite.close().await?;
        Ok(())
    }
}

/// Await a call's next response, decoding error statuses.
async fn get_response(rx: &mut mpsc::UnboundedReceiver<Response>) -> Result<Response> {
    let res = match rx.recv().await {
        Some(res) => res,
        None => return Err(Error::ConnectionClosed),
    };

    if res.status == PacketStatus::Error {
        error::decode_server_error(&res.payload)?;
    }

    Ok(res)
}

/// Drain a call's incoming stream until the server signals the end.
async fn process_download(
    rx: &mut mpsc::UnboundedReceiver<Response>,
    mut sink: Option<DownloadSink<'_>>,
) -> Result<Response> {
    loop {
        let res = get_response(rx).await?;

        // Ok acknowledges the end of the stream
        if res.status == PacketStatus::Ok {
            return Ok(res);
        }
        // libvirtd breaks protocol and ends some streams with an empty
        // Continue packet instead of Ok
        if res.payload.is_empty() {
            return Ok(res);
        }

        if let Some(sink) = sink.as_deref_mut() {
            sink.write_all(&res.payload).await?;
        }
    }
}

/// Feed a caller-supplied source to the server as stream packets.
///
/// Runs as its own task for the duration of one streaming call. Chunks
/// are capped so the packet stays under the server's size limit. The
/// abort signal wins over further reads; it is raised when the receive
/// side of the call fails.
async fn send_stream(
    inner: Arc<Inner>,
    serial: u32,
    program: u32,
    procedure: u32,
    mut source: UploadSource,
    mut abort: oneshot::Receiver<()>,
) -> Result<()> {
    let mut buf = vec![0u8; STREAM_CHUNK_MAX];
    loop {
        tokio::select! {
            biased;
            _ = &mut abort => {
                return inner
                    .send_packet(
                        Header::new(program, procedure, PacketType::Stream, serial, PacketStatus::Error),
                        &[],
                    )
                    .await;
            }
            read = source.read(&mut buf) => match read {
                Ok(0) => {
                    return inner
                        .send_packet(
                            Header::new(program, procedure, PacketType::Stream, serial, PacketStatus::Ok),
                            &[],
                        )
                        .await;
                }
                Ok(n) => {
                    inner
                        .send_packet(
                            Header::new(program, procedure, PacketType::Stream, serial, PacketStatus::Continue),
                            &buf[..n],
                        )
                        .await?;
                }
                Err(e) => {
                    // Tell the server the stream died, then surface the
                    // original read error
                    inner
                        .send_packet(
                            Header::new(program, procedure, PacketType::Stream, serial, PacketStatus::Error),
                            &[],
                        )
                        .await?;
                    return Err(Error::Io(e));
                }
            },
        }
    }
}

/// Reader task: owns the read half for the connection lifetime.
///
/// Routes event notifications by callback id and everything else by
/// serial. A frame whose header does not decode is dropped; the length
/// prefix already told us where the next packet starts, so the stream
/// cannot lose sync. Codec-level errors and end of stream terminate the
/// loop.
async fn listen(mut framedread: FramedRead<BoxReader, LengthDelimitedCodec>, inner: Arc<Inner>) {
    loop {
        let frame = match framedread.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                error!("reader terminating: {}", e);
                break;
            }
            None => {
                info!("connection closed by peer");
                break;
            }
        };

        let mut reader = frame.freeze().reader();
        let header = match Header::read_xdr(&mut reader) {
            Ok(header) => header,
            Err(e) => {
                warn!("dropping packet with undecodable header: {}", e);
                continue;
            }
        };
        let payload = reader.into_inner();

        if header.program == PROGRAM_QEMU && header.procedure == QEMU_PROC_DOMAIN_MONITOR_EVENT {
            inner.dispatch_event(&payload);
        } else {
            inner.deliver(
                header.serial,
                Response {
                    payload,
                    status: header.status,
                },
            );
        }
    }

    // Unblock every pending caller and end every event stream
    inner.calls.lock().unwrap_or_else(|e| e.into_inner()).clear();
    inner.events.lock().unwrap_or_else(|e| e.into_inner()).clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{is_not_found, ServerError, ERR_NO_DOMAIN, ERR_OK};
    use crate::packet::{Domain, PROGRAM_REMOTE};
    use std::io::Cursor;
    use tokio::io::{duplex, DuplexStream, ReadHalf, WriteHalf};

    /// The far end of a duplex pipe, speaking raw framed packets.
    struct TestServer {
        reader: FramedRead<ReadHalf<DuplexStream>, LengthDelimitedCodec>,
        writer: FramedWrite<WriteHalf<DuplexStream>, LengthDelimitedCodec>,
    }

    impl TestServer {
        fn new(stream: DuplexStream) -> TestServer {
            let (readhalf, writehalf) = tokio::io::split(stream);
            TestServer {
                reader: FramedRead::new(readhalf, packet::codec()),
                writer: FramedWrite::new(writehalf, packet::codec()),
            }
        }

        async fn recv(&mut self) -> (Header, Bytes) {
            let frame = self
                .reader
                .next()
                .await
                .expect("peer closed")
                .expect("frame error");
            let mut reader = frame.freeze().reader();
            let header = Header::read_xdr(&mut reader).expect("header decode");
            (header, reader.into_inner())
        }

        async fn send(&mut self, header: Header, payload: &[u8]) {
            let mut writer = BytesMut::new().writer();
            header.write_xdr(&mut writer).unwrap();
            let mut buf = writer.into_inner();
            buf.extend_from_slice(payload);
            self.writer.send(buf.freeze()).await.unwrap();
        }

        async fn send_reply(&mut self, serial: u32, status: PacketStatus, payload: &[u8]) {
            self.send(
                Header::new(PROGRAM_REMOTE, 0, PacketType::Reply, serial, status),
                payload,
            )
            .await;
        }

        async fn send_stream(&mut self, serial: u32, status: PacketStatus, payload: &[u8]) {
            self.send(
                Header::new(PROGRAM_REMOTE, 0, PacketType::Stream, serial, status),
                payload,
            )
            .await;
        }
    }

    fn pipe() -> (Client, TestServer) {
        let (client_side, server_side) = duplex(1 << 16);
        let (readhalf, writehalf) = tokio::io::split(client_side);
        (Client::new(readhalf, writehalf), TestServer::new(server_side))
    }

    fn not_found_record() -> Vec<u8> {
        xdr::to_bytes(&ServerError {
            code: ERR_NO_DOMAIN,
            domain: 10,
            padding: 0,
            message: "domain not found".to_owned(),
            level: 2,
        })
        .unwrap()
    }

    fn event_payload(callback_id: u32, event: &str) -> Vec<u8> {
        xdr::to_bytes(&DomainEvent {
            callback_id,
            domain: Domain {
                name: "guest".to_owned(),
                uuid: [0x11; 16],
                id: 4,
            },
            event: event.to_owned(),
            seconds: 1_700_000_000,
            micros: 0,
            details: None,
        })
        .unwrap()
    }

    fn monitor_event_header() -> Header {
        Header::new(
            PROGRAM_QEMU,
            QEMU_PROC_DOMAIN_MONITOR_EVENT,
            PacketType::Message,
            0,
            PacketStatus::Ok,
        )
    }

    #[tokio::test]
    async fn test_unary_roundtrip() {
        let (client, mut server) = pipe();

        let server_task = tokio::spawn(async move {
            let (header, payload) = server.recv().await;
            assert_eq!(header.program, PROGRAM_REMOTE);
            assert_eq!(header.procedure, 42);
            assert_eq!(header.typ, PacketType::Call);
            assert_eq!(header.status, PacketStatus::Ok);
            assert_eq!(header.serial, 1);
            assert_eq!(&payload[..], &[0x00, 0x11, 0x22, 0x33]);

            server
                .send_reply(header.serial, PacketStatus::Ok, &[0xaa, 0xbb])
                .await;
        });

        let resp = client
            .request(PROGRAM_REMOTE, 42, &[0x00, 0x11, 0x22, 0x33])
            .await
            .unwrap();
        assert_eq!(&resp[..], &[0xaa, 0xbb]);

        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_server_error_is_not_found() {
        let (client, mut server) = pipe();

        tokio::spawn(async move {
            let (header, _) = server.recv().await;
            server
                .send_reply(header.serial, PacketStatus::Error, &not_found_record())
                .await;
        });

        let err = client.request(PROGRAM_REMOTE, 99, &[]).await.unwrap_err();
        assert_eq!(format!("{}", err), "domain not found");
        assert!(is_not_found(&err));
    }

    #[tokio::test]
    async fn test_unknown_procedure_is_unsupported() {
        let (client, mut server) = pipe();

        tokio::spawn(async move {
            let (header, _) = server.recv().await;
            let record = xdr::to_bytes(&ServerError {
                code: 3,
                domain: 7,
                padding: 0,
                message: "unknown procedure: 12345".to_owned(),
                level: 2,
            })
            .unwrap();
            server
                .send_reply(header.serial, PacketStatus::Error, &record)
                .await;
        });

        let err = client.request(PROGRAM_REMOTE, 12345, &[]).await.unwrap_err();
        assert!(matches!(err, Error::Unsupported));
    }

    #[tokio::test]
    async fn test_err_ok_record_is_success() {
        let (client, mut server) = pipe();

        tokio::spawn(async move {
            let (header, _) = server.recv().await;
            let record = xdr::to_bytes(&ServerError {
                code: ERR_OK,
                domain: 0,
                padding: 0,
                message: "no error".to_owned(),
                level: 0,
            })
            .unwrap();
            server
                .send_reply(header.serial, PacketStatus::Error, &record)
                .await;
        });

        assert!(client.request(PROGRAM_REMOTE, 1, &[]).await.is_ok());
    }

    #[tokio::test]
    async fn test_download_reassembles_in_order() {
        let (client, mut server) = pipe();

        tokio::spawn(async move {
            let (header, _) = server.recv().await;
            server.send_reply(header.serial, PacketStatus::Ok, &[]).await;
            server
                .send_stream(header.serial, PacketStatus::Continue, b"abc")
                .await;
            server
                .send_stream(header.serial, PacketStatus::Continue, b"de")
                .await;
            server.send_stream(header.serial, PacketStatus::Ok, &[]).await;
        });

        let mut sink = Cursor::new(Vec::new());
        client
            .request_stream(
                PROGRAM_REMOTE,
                33,
                &[],
                None,
                Some(&mut sink as &mut (dyn AsyncWrite + Send + Unpin)),
            )
            .await
            .unwrap();

        assert_eq!(sink.into_inner(), b"abcde");
    }

    #[tokio::test]
    async fn test_empty_continue_ends_download() {
        let (client, mut server) = pipe();

        tokio::spawn(async move {
            let (header, _) = server.recv().await;
            server.send_reply(header.serial, PacketStatus::Ok, &[]).await;
            server
                .send_stream(header.serial, PacketStatus::Continue, b"abc")
                .await;
            // The quirky terminator some daemons send instead of Ok
            server
                .send_stream(header.serial, PacketStatus::Continue, &[])
                .await;
        });

        let mut sink = Cursor::new(Vec::new());
        client
            .request_stream(
                PROGRAM_REMOTE,
                33,
                &[],
                None,
                Some(&mut sink as &mut (dyn AsyncWrite + Send + Unpin)),
            )
            .await
            .unwrap();

        assert_eq!(sink.into_inner(), b"abc");
    }

    #[tokio::test]
    async fn test_download_aborts_on_server_error() {
        let (client, mut server) = pipe();

        tokio::spawn(async move {
            let (header, _) = server.recv().await;
            server.send_reply(header.serial, PacketStatus::Ok, &[]).await;
            server
                .send_stream(header.serial, PacketStatus::Continue, b"abc")
                .await;
            server
                .send_stream(header.serial, PacketStatus::Error, &not_found_record())
                .await;
        });

        let mut sink = Cursor::new(Vec::new());
        let err = client
            .request_stream(
                PROGRAM_REMOTE,
                33,
                &[],
                None,
                Some(&mut sink as &mut (dyn AsyncWrite + Send + Unpin)),
            )
            .await
            .unwrap_err();

        assert!(is_not_found(&err));
        assert_eq!(sink.into_inner(), b"abc");
    }

    #[tokio::test]
    async fn test_upload_chunking_and_confirmation() {
        let (client, mut server) = pipe();

        // Two chunks: one full, one partial
        let total = STREAM_CHUNK_MAX + 1024;
        let body: Vec<u8> = (0..total).map(|i| i as u8).collect();
        let expected = body.clone();

        let server_task = tokio::spawn(async move {
            let (call, _) = server.recv().await;
            server.send_reply(call.serial, PacketStatus::Ok, &[]).await;

            let mut received = Vec::new();
            let mut chunks = 0usize;
            loop {
                let (header, payload) = server.recv().await;
                assert_eq!(header.typ, PacketType::Stream);
                assert_eq!(header.serial, call.serial);
                match header.status {
                    PacketStatus::Continue => {
                        assert!(payload.len() <= STREAM_CHUNK_MAX);
                        received.extend_from_slice(&payload);
                        chunks += 1;
                    }
                    PacketStatus::Ok => break,
                    PacketStatus::Error => panic!("unexpected stream abort"),
                }
            }
            assert_eq!(chunks, 2);
            assert_eq!(received, expected);

            // Confirm receipt of the whole stream
            server.send_stream(call.serial, PacketStatus::Ok, &[]).await;
        });

        client
            .request_stream(
                PROGRAM_REMOTE,
                44,
                &[],
                Some(Box::new(Cursor::new(body)) as UploadSource),
                None,
            )
            .await
            .unwrap();

        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_upload_aborts_on_server_error() {
        let (client, mut server) = pipe();

        let server_task = tokio::spawn(async move {
            let (call, _) = server.recv().await;
            server.send_reply(call.serial, PacketStatus::Ok, &[]).await;

            // Take one chunk, then fail the call mid-stream
            let (header, _) = server.recv().await;
            assert_eq!(header.status, PacketStatus::Continue);
            server
                .send_reply(call.serial, PacketStatus::Error, &not_found_record())
                .await;

            // Keep draining until the client signals the abort
            loop {
                let (header, payload) = server.recv().await;
                if header.status == PacketStatus::Error {
                    assert_eq!(header.typ, PacketType::Stream);
                    assert!(payload.is_empty());
                    break;
                }
            }
        });

        let err = client
            .request_stream(
                PROGRAM_REMOTE,
                44,
                &[],
                Some(Box::new(tokio::io::repeat(0x61)) as UploadSource),
                None,
            )
            .await
            .unwrap_err();

        assert!(is_not_found(&err));
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_event_fanout_and_unsubscribe() {
        let (client, mut server) = pipe();

        let (tx7, mut rx7) = mpsc::unbounded_channel();
        let (tx8, mut rx8) = mpsc::unbounded_channel();
        client.subscribe(7, tx7);
        client.subscribe(8, tx8);

        server.send(monitor_event_header(), &event_payload(7, "STOP")).await;
        server.send(monitor_event_header(), &event_payload(8, "START")).await;
        server.send(monitor_event_header(), &event_payload(7, "RESUME")).await;

        assert_eq!(rx7.recv().await.unwrap().event, "STOP");
        assert_eq!(rx7.recv().await.unwrap().event, "RESUME");
        assert_eq!(rx8.recv().await.unwrap().event, "START");

        let server_task = tokio::spawn(async move {
            // The deregistration call for callback 7
            let (header, payload) = server.recv().await;
            assert_eq!(header.program, PROGRAM_QEMU);
            assert_eq!(
                header.procedure,
                QEMU_PROC_CONNECT_DOMAIN_MONITOR_EVENT_DEREGISTER
            );
            let callback_id: u32 = xdr::from_bytes(&payload).unwrap();
            assert_eq!(callback_id, 7);
            server.send_reply(header.serial, PacketStatus::Ok, &[]).await;

            // Late event for the dead subscription is dropped, later ones
            // for live subscriptions still flow
            server.send(monitor_event_header(), &event_payload(7, "LATE")).await;
            server.send(monitor_event_header(), &event_payload(8, "SHUTDOWN")).await;
        });

        client.unsubscribe(7).await.unwrap();

        assert!(rx7.recv().await.is_none());
        assert_eq!(rx8.recv().await.unwrap().event, "SHUTDOWN");

        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_serial_is_dropped() {
        let (client, mut server) = pipe();

        tokio::spawn(async move {
            let (header, _) = server.recv().await;
            // Nobody owns serial 999; the reader must shrug this off
            server.send_reply(999, PacketStatus::Ok, b"stray").await;
            server
                .send_reply(header.serial, PacketStatus::Ok, b"real")
                .await;
        });

        let resp = client.request(PROGRAM_REMOTE, 5, &[]).await.unwrap();
        assert_eq!(&resp[..], b"real");
    }

    #[tokio::test]
    async fn test_registry_empty_after_call() {
        let (client, mut server) = pipe();

        tokio::spawn(async move {
            let (header, _) = server.recv().await;
            server.send_reply(header.serial, PacketStatus::Ok, &[]).await;
        });

        client.request(PROGRAM_REMOTE, 5, &[]).await.unwrap();
        assert!(client.inner.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pending_call_unblocked_on_close() {
        let (client, mut server) = pipe();

        tokio::spawn(async move {
            let _ = server.recv().await;
            // Hang up without answering
            drop(server);
        });

        let err = client.request(PROGRAM_REMOTE, 5, &[]).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_concurrent_calls_pair_correctly() {
        let (client, mut server) = pipe();

        const TASKS: u32 = 4;
        const CALLS: u32 = 25;

        let server_task = tokio::spawn(async move {
            // Echo every call back to its serial; replies to different
            // callers interleave on the wire as the calls do
            let mut serials = std::collections::HashSet::new();
            for _ in 0..(TASKS * CALLS) {
                let (header, payload) = server.recv().await;
                assert!(serials.insert(header.serial), "serial reused");
                server
                    .send_reply(header.serial, PacketStatus::Ok, &payload)
                    .await;
            }
        });

        let mut workers = Vec::new();
        for task in 0..TASKS {
            let client = client.clone();
            workers.push(tokio::spawn(async move {
                for i in 0..CALLS {
                    let payload = xdr::to_bytes(&(task * 1000 + i)).unwrap();
                    let resp = client.request(PROGRAM_REMOTE, 9, &payload).await.unwrap();
                    assert_eq!(&resp[..], &payload[..]);
                }
            }));
        }

        for worker in workers {
            worker.await.unwrap();
        }
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_frame_dropped_loop_continues() {
        let (client, mut server) = pipe();

        tokio::spawn(async move {
            let (header, _) = server.recv().await;
            // A complete frame whose type field is garbage
            let bogus = Header::new(PROGRAM_REMOTE, 0, PacketType::Reply, header.serial, PacketStatus::Ok);
            let mut writer = BytesMut::new().writer();
            bogus.write_xdr(&mut writer).unwrap();
            let mut buf = writer.into_inner();
            buf[12..16].copy_from_slice(&99u32.to_be_bytes());
            server.writer.send(buf.freeze()).await.unwrap();

            server
                .send_reply(header.serial, PacketStatus::Ok, b"fine")
                .await;
        });

        let resp = client.request(PROGRAM_REMOTE, 5, &[]).await.unwrap();
        assert_eq!(&resp[..], b"fine");
    }
}
