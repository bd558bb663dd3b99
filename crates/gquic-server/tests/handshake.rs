//! End-to-end handshake tests against a session, with a minimal client that
//! performs the real key derivation.

use bytes::Bytes;
use gquic_core::{
    parse_frames, Frame, HandshakeMessage, PublicHeader, StreamFrame, StreamFrameSorter, Tag,
    CLIENT_HELLO_MINIMUM_SIZE, CRYPTO_STREAM_ID,
};
use gquic_server::Session;
use gquic_tls::{
    Aead, ChaCha20Poly1305Aead, Curve25519KeyExchange, Ed25519ProofSigner, KeyExchange, NullAead,
    ServerConfig,
};
use hkdf::Hkdf;
use sha2::Sha256;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

const CONNECTION_ID: u64 = 0x1337;
const CLIENT_IP: &str = "1.2.3.4";
const LEAF_CERT: &[u8] = b"leafcert";

fn server_config() -> Arc<ServerConfig> {
    Arc::new(ServerConfig::new(
        Box::new(Curve25519KeyExchange::new()),
        Arc::new(Ed25519ProofSigner::new(
            b"certchain".to_vec(),
            LEAF_CERT.to_vec(),
        )),
    ))
}

fn new_session(scfg: Arc<ServerConfig>) -> Session {
    let ip: IpAddr = CLIENT_IP.parse().expect("addr");
    Session::new(CONNECTION_ID, ip, 33, scfg)
}

/// Client half of the handshake, driving a [`Session`] directly.
struct TestClient {
    kex: Curve25519KeyExchange,
    nonce: [u8; 32],
    packet_number: u64,
    send_offset: u64,
    sorter: StreamFrameSorter,
    crypto_buffer: Vec<u8>,
}

impl TestClient {
    fn new() -> Self {
        Self {
            kex: Curve25519KeyExchange::new(),
            nonce: [0x5A; 32],
            packet_number: 1,
            send_offset: 0,
            sorter: StreamFrameSorter::new(),
            crypto_buffer: Vec::new(),
        }
    }

    fn seal_datagram(&mut self, aead: &dyn Aead, frames: &[Frame]) -> Vec<u8> {
        let packet_number = self.packet_number;
        self.packet_number += 1;
        let header = PublicHeader {
            connection_id: CONNECTION_ID,
            packet_number,
            diversification_nonce: None,
        };
        let mut datagram = Vec::new();
        header.write(&mut datagram);
        let header_len = datagram.len();
        let mut payload = Vec::new();
        for frame in frames {
            frame.write(&mut payload);
        }
        let sealed = aead.seal(packet_number, &datagram[..header_len], &payload);
        datagram.extend_from_slice(&sealed);
        datagram
    }

    fn seal_crypto_message(&mut self, aead: &dyn Aead, message: &[u8]) -> Vec<u8> {
        let frame = Frame::Stream(StreamFrame {
            stream_id: CRYPTO_STREAM_ID,
            offset: self.send_offset,
            data: Bytes::copy_from_slice(message),
            fin: false,
        });
        self.send_offset += message.len() as u64;
        self.seal_datagram(aead, &[frame])
    }

    /// Open server datagrams, feed crypto stream frames through the sorter,
    /// and return the next complete handshake message plus any
    /// diversification nonce seen in the packet headers.
    fn read_handshake_message(
        &mut self,
        aead: &dyn Aead,
        datagrams: &[Vec<u8>],
    ) -> (HandshakeMessage, Option<[u8; 32]>) {
        let mut div_nonce = None;
        for datagram in datagrams {
            let (header, header_len) = PublicHeader::parse(datagram).expect("header");
            if header.diversification_nonce.is_some() {
                div_nonce = header.diversification_nonce;
            }
            let plaintext = aead
                .open(
                    header.packet_number,
                    &datagram[..header_len],
                    &datagram[header_len..],
                )
                .expect("open server packet");
            for frame in parse_frames(&plaintext).expect("frames") {
                match frame {
                    Frame::Stream(f) if f.stream_id == CRYPTO_STREAM_ID => {
                        self.sorter.push(f).expect("sorter push");
                    }
                    Frame::Stream(_) => {}
                    Frame::ConnectionClose { error_code, reason } => {
                        panic!("server closed the connection: {reason} ({error_code})");
                    }
                }
            }
        }
        while let Some(frame) = self.sorter.pop() {
            self.crypto_buffer.extend_from_slice(&frame.data);
        }
        let (message, consumed) = HandshakeMessage::parse(&self.crypto_buffer)
            .expect("parse")
            .expect("complete message");
        self.crypto_buffer.drain(..consumed);
        (message, div_nonce)
    }
}

fn expand_keys(
    forward_secure: bool,
    shared: &[u8],
    nonces: &[u8],
    chlo: &[u8],
    scfg: &[u8],
) -> [u8; 72] {
    let label: &[u8] = if forward_secure {
        b"QUIC forward secure key expansion\x00"
    } else {
        b"QUIC key expansion\x00"
    };
    let mut info = Vec::new();
    info.extend_from_slice(label);
    info.extend_from_slice(&CONNECTION_ID.to_le_bytes());
    info.extend_from_slice(chlo);
    info.extend_from_slice(scfg);
    info.extend_from_slice(LEAF_CERT);
    let hkdf = Hkdf::<Sha256>::new(Some(nonces), shared);
    let mut okm = [0u8; 72];
    hkdf.expand(&info, &mut okm).expect("expand");
    okm
}

fn diversify(key: &mut [u8; 32], iv: &mut [u8; 4], div_nonce: &[u8]) {
    let mut secret = [0u8; 36];
    secret[..32].copy_from_slice(key);
    secret[32..].copy_from_slice(iv);
    let hkdf = Hkdf::<Sha256>::new(Some(div_nonce), &secret);
    let mut okm = [0u8; 36];
    hkdf.expand(b"QUIC key diversification", &mut okm)
        .expect("expand");
    key.copy_from_slice(&okm[..32]);
    iv.copy_from_slice(&okm[32..]);
}

/// Build the client's view of a key expansion: the server's send direction
/// becomes "other", optionally diversified.
fn client_aead(okm: &[u8; 72], div_nonce: Option<&[u8]>) -> ChaCha20Poly1305Aead {
    let my_key = &okm[0..32];
    let my_iv = &okm[64..68];
    let mut server_key: [u8; 32] = okm[32..64].try_into().unwrap();
    let mut server_iv: [u8; 4] = okm[68..72].try_into().unwrap();
    if let Some(nonce) = div_nonce {
        diversify(&mut server_key, &mut server_iv, nonce);
    }
    ChaCha20Poly1305Aead::new(&server_key, my_key, &server_iv, my_iv).expect("client aead")
}

fn inchoate_chlo() -> Vec<u8> {
    let mut params = BTreeMap::new();
    params.insert(Tag::SNI, b"quic.example.com".to_vec());
    params.insert(Tag::PAD, vec![b'a'; CLIENT_HELLO_MINIMUM_SIZE]);
    HandshakeMessage::new(Tag::CHLO, params).serialize()
}

fn complete_chlo(client: &TestClient, scid: &[u8], stk: &[u8]) -> Vec<u8> {
    let mut params = BTreeMap::new();
    params.insert(Tag::SNI, b"quic.example.com".to_vec());
    params.insert(Tag::SCID, scid.to_vec());
    params.insert(Tag::STK, stk.to_vec());
    params.insert(Tag::NONC, client.nonce.to_vec());
    params.insert(Tag::PUBS, client.kex.public_key());
    HandshakeMessage::new(Tag::CHLO, params).serialize()
}

struct RejContents {
    stk: Vec<u8>,
    scid: Vec<u8>,
    server_static_public: Vec<u8>,
    scfg_bytes: Vec<u8>,
}

fn run_inchoate_round(session: &mut Session, client: &mut TestClient) -> RejContents {
    let chlo = inchoate_chlo();
    let datagram = client.seal_crypto_message(&NullAead, &chlo);
    let responses = session.handle_datagram(&datagram);
    assert!(!responses.is_empty(), "expected a REJ");
    assert!(!session.handshake_complete());

    let (rej, _) = client.read_handshake_message(&NullAead, &responses);
    assert_eq!(rej.tag, Tag::REJ);
    assert!(rej.params.contains_key(&Tag::PROF), "v33 REJ carries a proof");
    assert_eq!(rej.params[&Tag::CERT], b"certchain");

    let scfg_bytes = rej.params[&Tag::SCFG].clone();
    let (scfg_msg, _) = HandshakeMessage::parse(&scfg_bytes)
        .expect("parse scfg")
        .expect("complete scfg");
    assert_eq!(scfg_msg.tag, Tag::SCFG);
    let pubs = &scfg_msg.params[&Tag::PUBS];

    RejContents {
        stk: rej.params[&Tag::STK].clone(),
        scid: scfg_msg.params[&Tag::SCID].clone(),
        server_static_public: pubs[3..].to_vec(),
        scfg_bytes,
    }
}

struct Established {
    initial: ChaCha20Poly1305Aead,
    forward_secure: ChaCha20Poly1305Aead,
}

fn run_complete_round(
    session: &mut Session,
    client: &mut TestClient,
    rej: &RejContents,
) -> Established {
    let chlo = complete_chlo(client, &rej.scid, &rej.stk);
    let datagram = client.seal_crypto_message(&NullAead, &chlo);
    let responses = session.handle_datagram(&datagram);
    assert!(!responses.is_empty(), "expected a SHLO");
    assert!(session.handshake_complete());
    assert!(!session.is_forward_secure());

    let shared = client
        .kex
        .calculate_shared_key(&rej.server_static_public)
        .expect("shared");
    // The initial expansion salts with the client nonce alone; the server's
    // send direction is diversified by the nonce in the packet header.
    let okm = expand_keys(false, &shared, &client.nonce, &chlo, &rej.scfg_bytes);

    // Peek the diversification nonce before opening anything.
    let (header, _) = PublicHeader::parse(&responses[0]).expect("header");
    let div_nonce = header
        .diversification_nonce
        .expect("v33 initial packets carry the diversification nonce");
    let initial = client_aead(&okm, Some(&div_nonce));

    let (shlo, _) = client.read_handshake_message(&initial, &responses);
    assert_eq!(shlo.tag, Tag::SHLO);
    let server_nonce = &shlo.params[&Tag::SNO];
    assert_eq!(server_nonce.len(), 32);
    assert!(shlo.params.contains_key(&Tag::VER));
    assert!(shlo.params.contains_key(&Tag::SFCW));

    let ephemeral_public = &shlo.params[&Tag::PUBS];
    let fs_shared = client
        .kex
        .calculate_shared_key(ephemeral_public)
        .expect("fs shared");
    let mut fs_nonces = Vec::with_capacity(64);
    fs_nonces.extend_from_slice(&client.nonce);
    fs_nonces.extend_from_slice(server_nonce);
    let fs_okm = expand_keys(true, &fs_shared, &fs_nonces, &chlo, &rej.scfg_bytes);
    let forward_secure = client_aead(&fs_okm, None);

    Established {
        initial,
        forward_secure,
    }
}

#[test]
fn long_handshake_rej_then_shlo() {
    let scfg = server_config();
    let mut session = new_session(scfg);
    let mut client = TestClient::new();

    let rej = run_inchoate_round(&mut session, &mut client);
    let established = run_complete_round(&mut session, &mut client, &rej);

    // Client sends application data under forward-secure protection.
    let app = Frame::Stream(StreamFrame {
        stream_id: 5,
        offset: 0,
        data: Bytes::from_static(b"hello over quic"),
        fin: true,
    });
    let datagram = client.seal_datagram(&established.forward_secure, &[app]);
    session.handle_datagram(&datagram);
    assert!(session.is_forward_secure());
    assert_eq!(
        session.pop_stream_data(5).expect("app data").data.as_ref(),
        b"hello over quic"
    );

    // The server now seals with the forward-secure keys.
    let responses = session.send_stream_data(5, b"hi there", true);
    let mut received = Vec::new();
    for response in &responses {
        let (header, header_len) = PublicHeader::parse(response).expect("header");
        assert!(
            header.diversification_nonce.is_none(),
            "nonce window closes after a forward-secure packet"
        );
        let plaintext = established
            .forward_secure
            .open(
                header.packet_number,
                &response[..header_len],
                &response[header_len..],
            )
            .expect("open under forward-secure keys");
        for frame in parse_frames(&plaintext).expect("frames") {
            if let Frame::Stream(f) = frame {
                received.extend_from_slice(&f.data);
            }
        }
    }
    assert_eq!(received, b"hi there");
}

#[test]
fn zero_rtt_handshake_with_a_cached_config() {
    let scfg = server_config();

    // First connection: learn the server config and a token.
    let mut first_session = new_session(Arc::clone(&scfg));
    let mut first_client = TestClient::new();
    let rej = run_inchoate_round(&mut first_session, &mut first_client);

    // Second connection: straight to the complete CHLO. Exactly one SHLO,
    // no REJ.
    let mut session = new_session(scfg);
    let mut client = TestClient::new();
    let established = run_complete_round(&mut session, &mut client, &rej);

    // The initial keys work both ways before any forward-secure packet.
    let probe = Frame::Stream(StreamFrame {
        stream_id: 7,
        offset: 0,
        data: Bytes::from_static(b"early data"),
        fin: false,
    });
    let datagram = client.seal_datagram(&established.initial, &[probe]);
    session.handle_datagram(&datagram);
    assert_eq!(
        session.pop_stream_data(7).expect("early data").data.as_ref(),
        b"early data"
    );
    assert!(!session.is_forward_secure());
}

#[test]
fn null_packets_are_rejected_after_escalation() {
    let scfg = server_config();
    let mut session = new_session(scfg);
    let mut client = TestClient::new();

    let rej = run_inchoate_round(&mut session, &mut client);
    let established = run_complete_round(&mut session, &mut client, &rej);

    // Null protection still opens while no stronger packet has arrived.
    let frame = Frame::Stream(StreamFrame {
        stream_id: 9,
        offset: 0,
        data: Bytes::from_static(b"still null"),
        fin: false,
    });
    let datagram = client.seal_datagram(&NullAead, std::slice::from_ref(&frame));
    session.handle_datagram(&datagram);
    assert_eq!(
        session.pop_stream_data(9).expect("data").data.as_ref(),
        b"still null"
    );

    // After a forward-secure packet, the ratchet refuses the null AEAD.
    let fs_frame = Frame::Stream(StreamFrame {
        stream_id: 11,
        offset: 0,
        data: Bytes::from_static(b"fs"),
        fin: false,
    });
    let datagram = client.seal_datagram(&established.forward_secure, &[fs_frame]);
    session.handle_datagram(&datagram);
    assert!(session.is_forward_secure());

    let late_null = Frame::Stream(StreamFrame {
        stream_id: 9,
        offset: 10,
        data: Bytes::from_static(b"too late"),
        fin: false,
    });
    let datagram = client.seal_datagram(&NullAead, &[late_null]);
    let responses = session.handle_datagram(&datagram);
    assert!(responses.is_empty());
    assert!(session.pop_stream_data(9).is_none());
    assert!(!session.is_closed());
}
