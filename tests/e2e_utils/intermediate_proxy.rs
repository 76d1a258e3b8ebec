#![cfg(test)]
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

/// CONNECT-only forward proxy. Targets are looked up in a name map before
/// falling back to regular resolution.
pub struct IntermediateProxy {
    listener: TcpListener,
    hosts: HashMap<String, SocketAddr>,
    refuse: bool,
    requests: Arc<Mutex<Vec<Vec<String>>>>,
}

impl IntermediateProxy {
    pub async fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        Ok(Self {
            listener,
            hosts: HashMap::new(),
            refuse: false,
            requests: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn with_host(mut self, host: &str, addr: SocketAddr) -> Self {
        self.hosts.insert(host.to_string(), addr);
        self
    }

    /// Answer every CONNECT with 403.
    pub fn refusing(mut self) -> Self {
        self.refuse = true;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.listener.local_addr()
    }

    /// Request heads received so far, one line per entry.
    pub fn requests(&self) -> Arc<Mutex<Vec<Vec<String>>>> {
        self.requests.clone()
    }

    pub fn run(self) -> JoinHandle<()> {
        let hosts = Arc::new(self.hosts);
        tokio::spawn(async move {
            while let Ok((socket, _addr)) = self.listener.accept().await {
                tokio::spawn(Self::handle_connection(
                    socket,
                    hosts.clone(),
                    self.refuse,
                    self.requests.clone(),
                ));
            }
        })
    }

    async fn handle_connection(
        socket: TcpStream,
        hosts: Arc<HashMap<String, SocketAddr>>,
        refuse: bool,
        requests: Arc<Mutex<Vec<Vec<String>>>>,
    ) {
        let mut reader = BufReader::new(socket);
        let mut head = Vec::new();
        loop {
            let mut line = String::new();
            match reader.read_line(&mut line).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
            let line = line.trim_end().to_string();
            if line.is_empty() {
                break;
            }
            head.push(line);
        }
        eprintln!("[IntermediateProxy] Received request:\n{}", head.join("\n"));
        requests.lock().unwrap().push(head.clone());
        let mut socket = reader.into_inner();

        let parts: Vec<&str> = head.first().map(|l| l.split_whitespace().collect()).unwrap_or_default();
        if parts.len() < 2 || parts[0] != "CONNECT" {
            let _ = socket.write_all(b"HTTP/1.1 405 Method Not Allowed\r\n\r\n").await;
            return;
        }
        if refuse {
            let _ = socket.write_all(b"HTTP/1.1 403 Forbidden\r\ncontent-length: 0\r\n\r\n").await;
            return;
        }

        let target = parts[1];
        let (host, port) = match target.rsplit_once(':') {
            Some((h, p)) => (h.to_string(), p.to_string()),
            None => (target.to_string(), "443".to_string()),
        };
        let connected = match hosts.get(&host) {
            Some(addr) => TcpStream::connect(addr).await,
            None => TcpStream::connect(format!("{}:{}", host, port)).await,
        };

        match connected {
            Ok(mut target_stream) => {
                let response = b"HTTP/1.1 200 Connection Established\r\n\r\n";
                if socket.write_all(response).await.is_ok() {
                    let _ = tokio::io::copy_bidirectional(&mut socket, &mut target_stream).await;
                }
            }
            Err(_) => {
                let _ = socket.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await;
            }
        }
    }
}
