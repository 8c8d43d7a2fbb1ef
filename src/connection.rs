use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use crate::{
    error::TransportError,
    packet::{FixedHeader, Packet, HEADER_LEN},
};

/// 连接接口 - 单个连接上的有序双向数据包通道
///
/// 连接只由一个处理者独占，从不共享。
#[async_trait]
pub trait Connection: Send {
    /// 发送数据包
    async fn send(&mut self, packet: Packet) -> Result<(), TransportError>;

    /// 接收下一个数据包
    ///
    /// 对端正常关闭时返回 `TransportError::Closed`
    async fn recv(&mut self) -> Result<Packet, TransportError>;

    /// 关闭连接
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// 基于字节流的分帧连接
///
/// 任何 `AsyncRead + AsyncWrite` 都可以作为底层流：生产环境是 `TcpStream`，
/// 测试中可以是 `tokio::io::duplex`。
pub struct FramedConnection<S> {
    stream: S,
    read_buffer: BytesMut,
}

impl<S> FramedConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            read_buffer: BytesMut::with_capacity(8192),
        }
    }

    /// 尝试从缓冲区解析下一个完整数据包
    fn try_parse_next_packet(&mut self) -> Result<Option<Packet>, TransportError> {
        if self.read_buffer.len() < HEADER_LEN {
            return Ok(None);
        }

        let header = FixedHeader::from_bytes(&self.read_buffer[..HEADER_LEN])?;
        let total_len = HEADER_LEN + header.payload_len as usize;
        if self.read_buffer.len() < total_len {
            self.read_buffer.reserve(total_len - self.read_buffer.len());
            return Ok(None);
        }

        self.read_buffer.advance(HEADER_LEN);
        let payload = self.read_buffer.split_to(header.payload_len as usize).to_vec();
        Ok(Some(Packet { header, payload }))
    }
}

impl FramedConnection<TcpStream> {
    /// 包装TCP流，开启TCP_NODELAY
    pub fn from_tcp(stream: TcpStream) -> Result<Self, TransportError> {
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }

    /// 连接到服务器
    pub async fn connect(addr: &str, timeout: std::time::Duration) -> Result<Self, TransportError> {
        tracing::debug!("🔌 TCP客户端连接到: {}", addr);

        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::timeout_error("connect", timeout))??;

        tracing::debug!("✅ TCP连接建立成功: {}", addr);
        Self::from_tcp(stream)
    }
}

#[async_trait]
impl<S> Connection for FramedConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, packet: Packet) -> Result<(), TransportError> {
        self.stream.write_all(&packet.to_bytes()).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Packet, TransportError> {
        loop {
            if let Some(packet) = self.try_parse_next_packet()? {
                return Ok(packet);
            }

            let bytes_read = self.stream.read_buf(&mut self.read_buffer).await?;
            if bytes_read == 0 {
                if self.read_buffer.is_empty() {
                    return Err(TransportError::Closed);
                }
                return Err(TransportError::connection_error(
                    format!("peer closed mid-packet ({} bytes buffered)", self.read_buffer.len()),
                    false,
                ));
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}
