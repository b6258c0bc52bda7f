use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// TCP connection that is opened and closed explicitly.
///
/// Unlike a self-healing stream, a reset connection is dropped and the error is
/// handed back to the caller, so the owner decides whether to reconnect.
pub struct TcpLink {
    addr: SocketAddr,
    stream: Option<TcpStream>,
    read_timeout: Duration,
    write_timeout: Duration,
    connect_timeout: Duration,
}

impl TcpLink {
    pub fn new(
        addr: SocketAddr,
        read_timeout: Duration,
        write_timeout: Duration,
        connect_timeout: Duration,
    ) -> Self {
        TcpLink {
            addr,
            stream: None,
            read_timeout,
            write_timeout,
            connect_timeout,
        }
    }

    /// Resolves `host:port` to the first socket address.
    pub fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
        (host, port).to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{}:{} did not resolve to any address", host, port),
            )
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    pub fn open(&mut self) -> io::Result<()> {
        self.close();

        let stream = TcpStream::connect_timeout(&self.addr, self.connect_timeout)?;
        stream.set_read_timeout(Some(self.read_timeout))?;
        stream.set_write_timeout(Some(self.write_timeout))?;
        stream.set_nodelay(true)?;

        self.stream = Some(stream);
        Ok(())
    }

    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn stream(&mut self) -> io::Result<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "link is closed"))
    }

    fn check<T>(&mut self, result: io::Result<T>) -> io::Result<T> {
        if let Err(e) = &result {
            if matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ) {
                self.close();
            }
        }
        result
    }
}

impl Read for TcpLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let result = self.stream()?.read(buf);
        let result = match result {
            Ok(0) if !buf.is_empty() => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed the connection",
            )),
            other => other,
        };
        self.check(result)
    }
}

impl Write for TcpLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let result = self.stream()?.write(buf);
        self.check(result)
    }

    fn flush(&mut self) -> io::Result<()> {
        let result = self.stream()?.flush();
        self.check(result)
    }
}

impl Drop for TcpLink {
    fn drop(&mut self) {
        self.close();
    }
}
