//! Echo server: every accepted TCP connection is hijacked into a `Stream` and
//! whatever the client sends is written straight back through it.
//!
//! ```text
//! cargo run --example echo
//! nc 127.0.0.1 8080
//! ```

use hijack_io::{Connection, EventLoop, EventLoopConfig, Handle, Stream};
use std::{
    net::TcpListener,
    sync::{Arc, Mutex, OnceLock, Weak},
    thread,
};
use tracing_subscriber::EnvFilter;

struct EchoConnection {
    peer: String,
    socket: Mutex<Option<Handle>>,
    stream: OnceLock<Weak<Stream>>,
}

impl Connection for EchoConnection {
    fn hijack(&self) -> hijack_io::Result<Option<Handle>> {
        Ok(self.socket.lock().unwrap().take())
    }

    fn parse(&self, data: &[u8]) {
        let Some(stream) = self.stream.get().and_then(Weak::upgrade) else {
            return;
        };
        if let Err(e) = stream.write(data.to_vec()) {
            tracing::error!("echo to {} failed: {}", self.peer, e);
        }
    }

    fn client_gone(&self) {
        tracing::info!("client {} disconnected", self.peer);
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let event_loop = Arc::new(EventLoop::new(EventLoopConfig::default())?);
    let el = event_loop.clone();
    let reactor = thread::Builder::new()
        .name("reactor".into())
        .spawn(move || el.run())?;

    let listener = TcpListener::bind("127.0.0.1:8080")?;
    tracing::info!("echo server listening on {}", listener.local_addr()?);

    for accepted in listener.incoming() {
        let socket = match accepted {
            Ok(socket) => socket,
            Err(e) => {
                tracing::warn!("accept failed: {}", e);
                continue;
            }
        };
        let peer = socket.peer_addr()?.to_string();
        socket.set_nonblocking(true)?;
        socket.set_nodelay(true)?;
        let handle: Handle = Arc::new(mio::net::TcpStream::from_std(socket));

        let connection = Arc::new(EchoConnection {
            peer: peer.clone(),
            socket: Mutex::new(Some(handle)),
            stream: OnceLock::new(),
        });
        let stream = Stream::new(event_loop.clone(), connection.clone());
        let _ = connection.stream.set(Arc::downgrade(&stream));

        match stream.hijack() {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!("client {} could not be hijacked", peer);
                continue;
            }
            Err(e) => {
                tracing::warn!("hijack of {} failed: {}", peer, e);
                continue;
            }
        }
        if let Err(e) = stream.write(format!("hello {}\r\n", peer)) {
            tracing::warn!("greeting {} failed: {}", peer, e);
        }
        tracing::info!("client {} connected", peer);
    }

    event_loop.stop();
    reactor
        .join()
        .map_err(|_| anyhow::anyhow!("reactor thread panicked"))??;
    Ok(())
}
