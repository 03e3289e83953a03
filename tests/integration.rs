use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::watch;

use tftpd::handle::{Handle, MemoryReader, ReadHandle};
use tftpd::{Packet, Server, ServerConfig};

/// Start a server backed by an in-memory filesystem (peer -> filename ->
/// bytes) and return its address plus the shutdown handle.
async fn start_server(
    files: HashMap<String, Vec<u8>>,
    uploads: Arc<Mutex<HashMap<String, Vec<u8>>>>,
) -> (SocketAddr, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut server = Server::bind(ServerConfig { listen: "127.0.0.1:0".into(), ..Default::default() })
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();

    let files = Arc::new(files);
    server.on_rrq(move |conn| {
        if let Some(data) = files.get(&conn.file) {
            conn.set_filesize(data.len() as u64);
            conn.attach_handle(Handle::Read(ReadHandle::Positioned(Box::new(MemoryReader::new(data.clone())))));
        }
    });

    let uploads_for_wrq = Arc::clone(&uploads);
    server.on_wrq(move |conn| {
        conn.attach_handle(tftpd::connection::write_handle(UploadSink {
            name: conn.file.clone(),
            store: Arc::clone(&uploads_for_wrq),
        }));
    });

    tokio::spawn(server.run(shutdown_rx));
    (addr, shutdown_tx)
}

struct UploadSink {
    name: String,
    store: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl tftpd::WriteSink for UploadSink {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> std::io::Result<()> {
        let mut guard = self.store.lock().unwrap();
        let buf = guard.entry(self.name.clone()).or_default();
        let offset = offset as usize;
        let end = offset + data.len();
        if buf.len() < end {
            buf.resize(end, 0);
        }
        buf[offset..end].copy_from_slice(data);
        Ok(())
    }
}

async fn recv_packet(client: &UdpSocket) -> (Packet, SocketAddr) {
    let mut buf = vec![0u8; 65536];
    let (n, from) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
        .await
        .expect("timed out waiting for a packet")
        .unwrap();
    (Packet::decode(&buf[..n]).unwrap(), from)
}

#[tokio::test]
async fn rrq_small_file_single_block() {
    let mut files = HashMap::new();
    files.insert("greeting.txt".to_string(), b"hello there".to_vec());
    let (addr, _shutdown) = start_server(files, Arc::new(Mutex::new(HashMap::new()))).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(&Packet::Rrq { filename: "greeting.txt".into(), mode: "octet".into(), options: HashMap::new() }.encode(), addr)
        .await
        .unwrap();

    let (pkt, from) = recv_packet(&client).await;
    match pkt {
        Packet::Data { block, payload } => {
            assert_eq!(block, 1);
            assert_eq!(payload, b"hello there");
        }
        other => panic!("expected DATA, got {other:?}"),
    }
    client.send_to(&Packet::Ack { block: 1 }.encode(), from).await.unwrap();
}

#[tokio::test]
async fn rrq_spanning_multiple_blocks() {
    let data: Vec<u8> = (0..1300u32).map(|i| (i % 256) as u8).collect();
    let mut files = HashMap::new();
    files.insert("big.bin".to_string(), data.clone());
    let (addr, _shutdown) = start_server(files, Arc::new(Mutex::new(HashMap::new()))).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(&Packet::Rrq { filename: "big.bin".into(), mode: "octet".into(), options: HashMap::new() }.encode(), addr)
        .await
        .unwrap();

    let mut received = Vec::new();
    let mut expected_block = 1u16;
    loop {
        let (pkt, from) = recv_packet(&client).await;
        let Packet::Data { block, payload } = pkt else { panic!("expected DATA") };
        assert_eq!(block, expected_block);
        let is_last = payload.len() < 512;
        received.extend_from_slice(&payload);
        client.send_to(&Packet::Ack { block }.encode(), from).await.unwrap();
        if is_last {
            break;
        }
        expected_block = expected_block.wrapping_add(1);
    }
    assert_eq!(received, data);
}

#[tokio::test]
async fn rrq_missing_file_sends_file_not_found() {
    let (addr, _shutdown) = start_server(HashMap::new(), Arc::new(Mutex::new(HashMap::new()))).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(&Packet::Rrq { filename: "nope.txt".into(), mode: "octet".into(), options: HashMap::new() }.encode(), addr)
        .await
        .unwrap();

    let (pkt, _) = recv_packet(&client).await;
    match pkt {
        Packet::Error { code, .. } => assert_eq!(code, tftpd::ErrorKind::FileNotFound.code()),
        other => panic!("expected ERROR, got {other:?}"),
    }
}

#[tokio::test]
async fn wrq_roundtrips_into_upload_store() {
    let uploads = Arc::new(Mutex::new(HashMap::new()));
    let (addr, _shutdown) = start_server(HashMap::new(), Arc::clone(&uploads)).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(&Packet::Wrq { filename: "upload.bin".into(), mode: "octet".into(), options: HashMap::new() }.encode(), addr)
        .await
        .unwrap();

    let (pkt, from) = recv_packet(&client).await;
    assert_eq!(pkt, Packet::Ack { block: 0 });

    let payload = vec![9u8; 300];
    client.send_to(&Packet::Data { block: 1, payload: payload.clone() }.encode(), from).await.unwrap();
    let (pkt, _) = recv_packet(&client).await;
    assert_eq!(pkt, Packet::Ack { block: 1 });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(uploads.lock().unwrap().get("upload.bin").cloned(), Some(payload));
}

#[tokio::test]
async fn option_negotiation_via_oack_then_blocks() {
    let data = vec![5u8; 2000];
    let mut files = HashMap::new();
    files.insert("opts.bin".to_string(), data.clone());
    let (addr, _shutdown) = start_server(files, Arc::new(Mutex::new(HashMap::new()))).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut options = HashMap::new();
    options.insert("blksize".to_string(), "1024".to_string());
    options.insert("tsize".to_string(), "0".to_string());
    client
        .send_to(&Packet::Rrq { filename: "opts.bin".into(), mode: "octet".into(), options }.encode(), addr)
        .await
        .unwrap();

    let (pkt, from) = recv_packet(&client).await;
    match pkt {
        Packet::Oack { options } => {
            assert_eq!(options.get("blksize").unwrap(), "1024");
            assert_eq!(options.get("tsize").unwrap(), "2000");
        }
        other => panic!("expected OACK, got {other:?}"),
    }
    client.send_to(&Packet::Ack { block: 0 }.encode(), from).await.unwrap();

    let (pkt, from) = recv_packet(&client).await;
    let Packet::Data { block: 1, payload } = pkt else { panic!("expected DATA block 1") };
    assert_eq!(payload.len(), 1024);
    client.send_to(&Packet::Ack { block: 1 }.encode(), from).await.unwrap();

    let (pkt, _) = recv_packet(&client).await;
    let Packet::Data { block: 2, payload } = pkt else { panic!("expected DATA block 2") };
    assert_eq!(payload.len(), 976);
}

#[tokio::test]
async fn unknown_opcode_on_live_connection_aborts_transfer() {
    let mut files = HashMap::new();
    files.insert("a.bin".to_string(), vec![1u8; 512]);
    let (addr, _shutdown) = start_server(files, Arc::new(Mutex::new(HashMap::new()))).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(&Packet::Rrq { filename: "a.bin".into(), mode: "octet".into(), options: HashMap::new() }.encode(), addr)
        .await
        .unwrap();
    let (_pkt, from) = recv_packet(&client).await;

    // Sending DATA back to an rrq connection is a protocol violation.
    client.send_to(&Packet::Data { block: 9, payload: vec![] }.encode(), from).await.unwrap();
    let (pkt, _) = recv_packet(&client).await;
    match pkt {
        Packet::Error { code, .. } => assert_eq!(code, tftpd::ErrorKind::IllegalOperation.code()),
        other => panic!("expected ERROR, got {other:?}"),
    }
}
