//! Minimal MQTT 3.1.1 broker for session and engine tests
//!
//! Speaks just enough of the protocol for one client per connection:
//! CONNECT, SUBSCRIBE, PUBLISH (QoS 0/1), PINGREQ and DISCONNECT.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Default)]
pub struct BrokerBehaviour {
    /// Answer CONNECT with "not authorized"
    pub refuse: bool,
    /// Answer SUBSCRIBE with a failure return code
    pub reject_subscribe: bool,
    /// Close the socket right after SUBACK and retained messages
    pub drop_after_suback: bool,
    /// Never acknowledge QoS 1 publishes
    pub withhold_puback: bool,
    /// Published to the client right after SUBACK
    pub retained: Vec<(String, Vec<u8>)>,
}

pub struct FakeBroker {
    port: u16,
    connections: Arc<AtomicUsize>,
    published: mpsc::UnboundedReceiver<(String, Vec<u8>)>,
    task: JoinHandle<()>,
}

impl FakeBroker {
    pub async fn start(behaviour: BrokerBehaviour) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let connections = Arc::new(AtomicUsize::new(0));
        let (published_tx, published) = mpsc::unbounded_channel();

        let counter = Arc::clone(&connections);
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let behaviour = behaviour.clone();
                let published = published_tx.clone();
                tokio::spawn(async move {
                    let _ = serve(stream, behaviour, published).await;
                });
            }
        });

        Self {
            port,
            connections,
            published,
            task,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Next publish received from a client
    pub async fn next_published(&mut self) -> Option<(String, Vec<u8>)> {
        self.published.recv().await
    }
}

impl Drop for FakeBroker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(
    mut stream: TcpStream,
    behaviour: BrokerBehaviour,
    published: mpsc::UnboundedSender<(String, Vec<u8>)>,
) -> std::io::Result<()> {
    loop {
        let (header, body) = read_packet(&mut stream).await?;
        match header & 0xF0 {
            0x10 => {
                let code = if behaviour.refuse { 0x05 } else { 0x00 };
                stream.write_all(&[0x20, 0x02, 0x00, code]).await?;
                if behaviour.refuse {
                    return Ok(());
                }
            }
            0x80 => {
                let code = if behaviour.reject_subscribe { 0x80 } else { 0x02 };
                stream.write_all(&[0x90, 0x03, body[0], body[1], code]).await?;
                for (topic, payload) in &behaviour.retained {
                    let mut packet = Vec::new();
                    packet.extend_from_slice(&(topic.len() as u16).to_be_bytes());
                    packet.extend_from_slice(topic.as_bytes());
                    packet.extend_from_slice(payload);
                    stream.write_all(&encode(0x31, &packet)).await?;
                }
                if behaviour.drop_after_suback {
                    return Ok(());
                }
            }
            0x30 => {
                let qos = (header >> 1) & 0x03;
                let topic_len = u16::from_be_bytes([body[0], body[1]]) as usize;
                let topic = String::from_utf8_lossy(&body[2..2 + topic_len]).to_string();
                let mut offset = 2 + topic_len;
                let pkid = if qos > 0 {
                    offset += 2;
                    Some([body[offset - 2], body[offset - 1]])
                } else {
                    None
                };
                let _ = published.send((topic, body[offset..].to_vec()));
                if let Some(pkid) = pkid {
                    if !behaviour.withhold_puback {
                        stream.write_all(&[0x40, 0x02, pkid[0], pkid[1]]).await?;
                    }
                }
            }
            0xC0 => stream.write_all(&[0xD0, 0x00]).await?,
            0xE0 => return Ok(()),
            _ => {}
        }
    }
}

async fn read_packet(stream: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
    let header = stream.read_u8().await?;
    let mut len = 0usize;
    let mut shift = 0;
    loop {
        let byte = stream.read_u8().await?;
        len |= ((byte & 0x7F) as usize) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    let mut body = vec![0; len];
    stream.read_exact(&mut body).await?;
    Ok((header, body))
}

fn encode(header: u8, body: &[u8]) -> Vec<u8> {
    let mut packet = vec![header];
    let mut len = body.len();
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        packet.push(byte);
        if len == 0 {
            break;
        }
    }
    packet.extend_from_slice(body);
    packet
}
