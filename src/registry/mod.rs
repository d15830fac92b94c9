//! Link registry.
//!
//! Keeps at most one live link per device id, verifies that the
//! certificate presented during the handshake belongs to the device id
//! the peer announced, enforces the unpaired-connection cap and
//! publishes ready links upward as `LinkReady` events. The registry
//! holds non-owning handles; the published [`Link`] clones belong to
//! the device-link layer above this crate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use rustls::pki_types::CertificateDer;
use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::IdentityStore;
use crate::error::{LanLinkError, Result};
use crate::protocol::constants::MAX_UNPAIRED_CONNECTIONS;
use crate::protocol::IdentityPacket;
use crate::tls;

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// Capacity of the per-link inbound channel. Bounded so a peer cannot
/// grow memory faster than the device-link layer drains it.
const INCOMING_CHANNEL_CAPACITY: usize = 64;

/// Notification that the device-link layer released a link.
#[derive(Debug)]
pub(crate) struct ClosedLink {
    pub device_id: String,
    pub handle: u64,
}

/// An authenticated, encrypted byte stream bound to a device id.
///
/// Cheap to clone; all clones share the underlying stream. Reads and
/// writes are independent, so a blocked [`recv`](Self::recv) never
/// holds up [`send`](Self::send). When the same peer reconnects with
/// the same certificate the registry swaps the socket in place and
/// chunks already received stay queued for the reader.
pub struct Link<S> {
    shared: Arc<LinkShared<S>>,
}

struct LinkShared<S> {
    handle: u64,
    remote_identity: IdentityPacket,
    peer_certificate: CertificateDer<'static>,
    writer: Mutex<WriteHalf<S>>,
    incoming_rx: Mutex<mpsc::Receiver<Bytes>>,
    incoming_tx: mpsc::Sender<Bytes>,
    reader_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    closed_tx: mpsc::UnboundedSender<ClosedLink>,
}

impl<S> Clone for Link<S> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<S> std::fmt::Debug for Link<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("device_id", &self.shared.remote_identity.device_id)
            .field("handle", &self.shared.handle)
            .finish()
    }
}

impl<S> Link<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    fn new(
        remote_identity: IdentityPacket,
        peer_certificate: CertificateDer<'static>,
        stream: S,
        closed_tx: mpsc::UnboundedSender<ClosedLink>,
    ) -> Self {
        let (reader, writer) = split(stream);
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_CHANNEL_CAPACITY);
        let reader_task = spawn_reader(reader, incoming_tx.clone());

        Self {
            shared: Arc::new(LinkShared {
                handle: NEXT_HANDLE.fetch_add(1, Ordering::Relaxed),
                remote_identity,
                peer_certificate,
                writer: Mutex::new(writer),
                incoming_rx: Mutex::new(incoming_rx),
                incoming_tx,
                reader_task: std::sync::Mutex::new(Some(reader_task)),
                closed: AtomicBool::new(false),
                closed_tx,
            }),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.shared.remote_identity.device_id
    }

    pub fn remote_identity(&self) -> &IdentityPacket {
        &self.shared.remote_identity
    }

    pub fn peer_certificate(&self) -> &CertificateDer<'static> {
        &self.shared.peer_certificate
    }

    /// Writes and flushes one chunk of application data.
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(LanLinkError::ConnectionClosed);
        }
        let mut writer = self.shared.writer.lock().await;
        writer.write_all(data).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Receives the next chunk of application data. `None` means the
    /// socket ended; the link stays registered and resumes delivering
    /// data if the peer reconnects before it is closed.
    pub async fn recv(&self) -> Result<Option<Bytes>> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(LanLinkError::ConnectionClosed);
        }
        match self.shared.incoming_rx.lock().await.recv().await {
            // The reader task marks end of stream with an empty chunk.
            Some(chunk) if chunk.is_empty() => Ok(None),
            Some(chunk) => Ok(Some(chunk)),
            None => Ok(None),
        }
    }

    /// Releases the link. The registry drops its handle in response.
    pub fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::AcqRel) {
            self.stop_reader();
            let _ = self.shared.closed_tx.send(ClosedLink {
                device_id: self.shared.remote_identity.device_id.clone(),
                handle: self.shared.handle,
            });
        }
    }

    /// Swaps in a fresh socket from a reconnect. Chunks already queued
    /// stay readable; the old socket is dropped, which closes it.
    pub(crate) async fn reset(&self, stream: S) {
        let (reader, writer) = split(stream);
        self.stop_reader();
        *self.shared.writer.lock().await = writer;
        let task = spawn_reader(reader, self.shared.incoming_tx.clone());
        *self
            .shared
            .reader_task
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(task);
    }

    pub(crate) fn handle(&self) -> u64 {
        self.shared.handle
    }

    fn stop_reader(&self) {
        if let Some(task) = self
            .shared
            .reader_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
    }
}

impl<S> Drop for LinkShared<S> {
    fn drop(&mut self) {
        if let Some(task) = self
            .reader_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
    }
}

fn spawn_reader<S>(mut reader: ReadHalf<S>, incoming_tx: mpsc::Sender<Bytes>) -> JoinHandle<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = BytesMut::with_capacity(8 * 1024);
        loop {
            match reader.read_buf(&mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let chunk = buf.split().freeze();
                    if incoming_tx.send(chunk).await.is_err() {
                        return;
                    }
                }
                Err(err) => {
                    debug!("link read error: {}", err);
                    break;
                }
            }
        }
        // End-of-stream marker; a real chunk is never empty.
        let _ = incoming_tx.send(Bytes::new()).await;
    })
}

/// Live-link bookkeeping, mutated only from the provider's event loop.
pub(crate) struct Registry<S> {
    store: Arc<dyn IdentityStore>,
    links: HashMap<String, Link<S>>,
    ready_tx: mpsc::UnboundedSender<Link<S>>,
    closed_tx: mpsc::UnboundedSender<ClosedLink>,
}

impl<S> Registry<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(
        store: Arc<dyn IdentityStore>,
        ready_tx: mpsc::UnboundedSender<Link<S>>,
        closed_tx: mpsc::UnboundedSender<ClosedLink>,
    ) -> Self {
        Self {
            store,
            links: HashMap::new(),
            ready_tx,
            closed_tx,
        }
    }

    /// Accepts a freshly encrypted connection. Publishes at most one
    /// `LinkReady` per new device; dropping the stream on any refusal
    /// closes the socket.
    pub async fn publish(
        &mut self,
        stream: S,
        identity: IdentityPacket,
        peer_certificate: CertificateDer<'static>,
    ) {
        let device_id = identity.device_id.clone();

        let cert_device_id = tls::peer_device_id(&peer_certificate);
        if cert_device_id.as_deref() != Some(device_id.as_str()) {
            warn!(
                "device id in certificate does not match identity packet: {:?} vs {:?}",
                cert_device_id, device_id
            );
            return;
        }

        if let Some(existing) = self.links.get(&device_id) {
            if existing.peer_certificate().as_ref() != peer_certificate.as_ref() {
                warn!(
                    "refusing to replace socket for {}: certificate changed",
                    device_id
                );
                return;
            }
            debug!("reusing link to {}", device_id);
            existing.reset(stream).await;
            return;
        }

        if !self.store.is_trusted(&device_id) && self.links.len() >= MAX_UNPAIRED_CONNECTIONS {
            warn!(
                "too many unpaired devices to remember them all, ignoring {}",
                device_id
            );
            return;
        }

        let link = Link::new(identity, peer_certificate, stream, self.closed_tx.clone());
        self.links.insert(device_id, link.clone());
        let _ = self.ready_tx.send(link);
    }

    /// Handles a destruction report from the device-link layer.
    pub fn remove_closed(&mut self, closed: ClosedLink) {
        debug!("link to {} destroyed", closed.device_id);
        if let Some(link) = self.links.remove(&closed.device_id) {
            debug_assert_eq!(
                link.handle(),
                closed.handle,
                "destroyed link does not match the registered one"
            );
        }
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceInfo, MemoryIdentityStore};
    use crate::protocol::constants::PROTOCOL_VERSION;
    use crate::protocol::DeviceType;
    use tokio::io::{duplex, DuplexStream};

    fn identity(device_id: &str) -> IdentityPacket {
        IdentityPacket {
            device_id: device_id.to_string(),
            device_name: "peer".to_string(),
            device_type: DeviceType::Phone,
            protocol_version: PROTOCOL_VERSION,
            incoming_capabilities: Default::default(),
            outgoing_capabilities: Default::default(),
            tcp_port: None,
        }
    }

    fn peer(device_id: &str) -> (IdentityPacket, CertificateDer<'static>) {
        let store = MemoryIdentityStore::new(DeviceInfo {
            id: device_id.to_string(),
            name: "peer".to_string(),
            device_type: DeviceType::Phone,
        })
        .unwrap();
        (identity(device_id), store.certificate())
    }

    struct Harness {
        registry: Registry<DuplexStream>,
        ready_rx: mpsc::UnboundedReceiver<Link<DuplexStream>>,
        closed_rx: mpsc::UnboundedReceiver<ClosedLink>,
        local: Arc<MemoryIdentityStore>,
    }

    fn harness() -> Harness {
        let local =
            Arc::new(MemoryIdentityStore::generate("local", DeviceType::Desktop).unwrap());
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        let registry = Registry::new(local.clone() as Arc<dyn IdentityStore>, ready_tx, closed_tx);
        Harness {
            registry,
            ready_rx,
            closed_rx,
            local,
        }
    }

    #[tokio::test]
    async fn test_publish_emits_single_link_ready() {
        let mut h = harness();
        let (id, cert) = peer("aaaa1111aaaa1111aaaa1111aaaa1111");
        let (near, _far) = duplex(256);
        h.registry.publish(near, id, cert).await;

        let link = h.ready_rx.try_recv().unwrap();
        assert_eq!(link.device_id(), "aaaa1111aaaa1111aaaa1111aaaa1111");
        assert!(h.ready_rx.try_recv().is_err());
        assert_eq!(h.registry.len(), 1);
    }

    #[tokio::test]
    async fn test_certificate_identity_mismatch_refused() {
        let mut h = harness();
        let (_, cert) = peer("bbbb2222bbbb2222bbbb2222bbbb2222");
        let (near, mut far) = duplex(256);
        // The identity claims a different device id than the cert CN.
        h.registry
            .publish(near, identity("cccc3333cccc3333cccc3333cccc3333"), cert)
            .await;

        assert!(h.ready_rx.try_recv().is_err());
        assert_eq!(h.registry.len(), 0);
        // Refusal drops the stream, which the peer observes as EOF.
        let mut buf = [0u8; 1];
        assert_eq!(far.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_same_certificate_reuses_link() {
        let mut h = harness();
        let (id, cert) = peer("dddd4444dddd4444dddd4444dddd4444");
        let (near1, mut far1) = duplex(256);
        h.registry.publish(near1, id.clone(), cert.clone()).await;
        let link = h.ready_rx.try_recv().unwrap();

        let (near2, mut far2) = duplex(256);
        h.registry.publish(near2, id, cert).await;
        // No second LinkReady; the link now writes into the new socket.
        assert!(h.ready_rx.try_recv().is_err());
        assert_eq!(h.registry.len(), 1);

        link.send(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        far2.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        // The replaced socket was dropped.
        let mut eof = [0u8; 1];
        assert_eq!(far1.read(&mut eof).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reset_keeps_queued_chunks_readable() {
        let mut h = harness();
        let (id, cert) = peer("1234abcd1234abcd1234abcd1234abcd");
        let (near1, mut far1) = duplex(256);
        h.registry.publish(near1, id.clone(), cert.clone()).await;
        let link = h.ready_rx.try_recv().unwrap();

        far1.write_all(b"queued").await.unwrap();
        far1.flush().await.unwrap();
        // Give the reader task a chance to queue the chunk.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let (near2, mut far2) = duplex(256);
        h.registry.publish(near2, id, cert).await;

        let chunk = link.recv().await.unwrap().unwrap();
        assert_eq!(chunk.as_ref(), b"queued");

        far2.write_all(b"fresh").await.unwrap();
        far2.flush().await.unwrap();
        let chunk = link.recv().await.unwrap().unwrap();
        assert_eq!(chunk.as_ref(), b"fresh");
    }

    #[tokio::test]
    async fn test_changed_certificate_refused() {
        let mut h = harness();
        let (id, cert) = peer("eeee5555eeee5555eeee5555eeee5555");
        let (near1, _far1) = duplex(256);
        h.registry.publish(near1, id.clone(), cert).await;
        let _ = h.ready_rx.try_recv().unwrap();

        // Same device id, different keypair.
        let (_, other_cert) = peer("eeee5555eeee5555eeee5555eeee5555");
        let (near2, mut far2) = duplex(256);
        h.registry.publish(near2, id, other_cert).await;

        assert!(h.ready_rx.try_recv().is_err());
        assert_eq!(h.registry.len(), 1);
        let mut buf = [0u8; 1];
        assert_eq!(far2.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unpaired_cap_enforced() {
        let mut h = harness();
        let mut fars = Vec::new();
        for n in 0..MAX_UNPAIRED_CONNECTIONS {
            let (id, cert) = peer(&format!("{:032}", n));
            let (near, far) = duplex(64);
            fars.push(far);
            h.registry.publish(near, id, cert).await;
            assert!(h.ready_rx.try_recv().is_ok());
        }
        assert_eq!(h.registry.len(), MAX_UNPAIRED_CONNECTIONS);

        let (id, cert) = peer(&format!("{:032}", MAX_UNPAIRED_CONNECTIONS));
        let (near, _far) = duplex(64);
        h.registry.publish(near, id, cert).await;
        assert!(h.ready_rx.try_recv().is_err());
        assert_eq!(h.registry.len(), MAX_UNPAIRED_CONNECTIONS);
    }

    #[tokio::test]
    async fn test_trusted_peer_bypasses_unpaired_cap() {
        let mut h = harness();
        let mut fars = Vec::new();
        for n in 0..MAX_UNPAIRED_CONNECTIONS {
            let (id, cert) = peer(&format!("{:032}", n));
            let (near, far) = duplex(64);
            fars.push(far);
            h.registry.publish(near, id, cert).await;
        }

        let (id, cert) = peer("ffff6666ffff6666ffff6666ffff6666");
        h.local.trust_peer(&id.device_id, cert.clone());
        let (near, _far) = duplex(64);
        h.registry.publish(near, id, cert).await;
        while h.ready_rx.try_recv().is_ok() {}
        assert_eq!(h.registry.len(), MAX_UNPAIRED_CONNECTIONS + 1);
    }

    #[tokio::test]
    async fn test_close_removes_entry() {
        let mut h = harness();
        let (id, cert) = peer("99990000999900009999000099990000");
        let (near, _far) = duplex(64);
        h.registry.publish(near, id, cert).await;
        let link = h.ready_rx.try_recv().unwrap();

        link.close();
        let closed = h.closed_rx.try_recv().unwrap();
        assert_eq!(closed.device_id, link.device_id());
        h.registry.remove_closed(closed);
        assert_eq!(h.registry.len(), 0);

        // Closing twice reports once.
        link.close();
        assert!(h.closed_rx.try_recv().is_err());
        assert!(matches!(
            link.send(b"x").await,
            Err(LanLinkError::ConnectionClosed)
        ));
    }
}
