/// 数据包与消息定义
///
/// 线上格式：10字节固定头部 + JSON负载。
/// 消息本身是封闭的和类型 (`Request` / `Reply`)，未知类型一律拒绝。

use std::sync::atomic::{AtomicU32, Ordering};
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize, de::DeserializeOwned};
use crate::error::TransportError;

/// 协议版本
pub const PROTOCOL_VERSION: u8 = 1;

/// 固定头部长度
pub const HEADER_LEN: usize = 10;

/// 负载上限 (1 MiB)
pub const MAX_PAYLOAD_LEN: usize = 1024 * 1024;

/// 数据包类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// 客户端 -> 服务端
    Request = 1,
    /// 服务端 -> 客户端
    Reply = 2,
}

impl TryFrom<u8> for PacketType {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(PacketType::Request),
            2 => Ok(PacketType::Reply),
            other => Err(PacketError::UnknownPacketType(other)),
        }
    }
}

impl From<PacketType> for u8 {
    fn from(packet_type: PacketType) -> Self {
        packet_type as u8
    }
}

/// 10字节固定头部 (大端序)
///
/// | version (1) | packet_type (1) | message_id (4) | payload_len (4) |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedHeader {
    pub version: u8,
    pub packet_type: PacketType,
    pub message_id: u32,
    pub payload_len: u32,
}

impl FixedHeader {
    /// 创建新的固定头部
    pub fn new(packet_type: PacketType, message_id: u32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            packet_type,
            message_id,
            payload_len: 0,
        }
    }

    /// 序列化为字节数组 (大端序)
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[0] = self.version;
        bytes[1] = u8::from(self.packet_type);
        bytes[2..6].copy_from_slice(&self.message_id.to_be_bytes());
        bytes[6..10].copy_from_slice(&self.payload_len.to_be_bytes());
        bytes
    }

    /// 从字节数组反序列化 (大端序)
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() < HEADER_LEN {
            return Err(PacketError::InvalidHeader(format!("Header too short: {} bytes", bytes.len())));
        }

        let version = bytes[0];
        if version != PROTOCOL_VERSION {
            return Err(PacketError::UnsupportedVersion(version));
        }

        let packet_type = PacketType::try_from(bytes[1])?;
        let message_id = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
        let payload_len = u32::from_be_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]);

        if payload_len as usize > MAX_PAYLOAD_LEN {
            return Err(PacketError::PayloadTooLarge(payload_len as usize));
        }

        Ok(Self {
            version,
            packet_type,
            message_id,
            payload_len,
        })
    }
}

/// 消息ID管理器 - 线程安全
#[derive(Debug)]
pub struct MessageIdManager {
    counter: AtomicU32,
}

impl MessageIdManager {
    /// 创建新的ID管理器
    pub fn new() -> Self {
        Self {
            counter: AtomicU32::new(1), // 从1开始
        }
    }

    /// 获取下一个ID
    pub fn next_id(&self) -> u32 {
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        if id == u32::MAX {
            // 达到最大值，重置为1
            self.counter.store(1, Ordering::SeqCst);
            1
        } else {
            id
        }
    }
}

impl Default for MessageIdManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 客户端请求
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Request {
    /// 请求下一帧的时钟读数
    Tick { cmd: i32 },
}

/// 服务端回复
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reply {
    /// 当前时钟读数
    Clock { at: DateTime<Utc> },
}

impl Reply {
    /// 以当前时间创建时钟回复
    pub fn clock_now() -> Self {
        Reply::Clock { at: Utc::now() }
    }
}

/// 数据包结构
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// 固定头部
    pub header: FixedHeader,
    /// 负载数据 (JSON)
    pub payload: Vec<u8>,
}

impl Packet {
    fn encode<T: Serialize>(packet_type: PacketType, message_id: u32, body: &T) -> Result<Self, PacketError> {
        let payload = serde_json::to_vec(body)
            .map_err(|e| PacketError::SerializationError(e.to_string()))?;
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(PacketError::PayloadTooLarge(payload.len()));
        }

        let mut header = FixedHeader::new(packet_type, message_id);
        header.payload_len = payload.len() as u32;
        Ok(Self { header, payload })
    }

    fn decode<T: DeserializeOwned>(&self, expected: PacketType) -> Result<T, PacketError> {
        if self.header.packet_type != expected {
            return Err(PacketError::UnexpectedPacketType {
                expected,
                actual: self.header.packet_type,
            });
        }
        serde_json::from_slice(&self.payload)
            .map_err(|e| PacketError::UnknownMessage(e.to_string()))
    }

    /// 创建请求数据包
    pub fn request(message_id: u32, request: &Request) -> Result<Self, PacketError> {
        Self::encode(PacketType::Request, message_id, request)
    }

    /// 创建回复数据包
    pub fn reply(message_id: u32, reply: &Reply) -> Result<Self, PacketError> {
        Self::encode(PacketType::Reply, message_id, reply)
    }

    /// 解析为请求
    pub fn to_request(&self) -> Result<Request, PacketError> {
        self.decode(PacketType::Request)
    }

    /// 解析为回复
    pub fn to_reply(&self) -> Result<Reply, PacketError> {
        self.decode(PacketType::Reply)
    }

    /// 获取消息ID
    pub fn message_id(&self) -> u32 {
        self.header.message_id
    }

    /// 序列化为线上字节
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.payload.len());
        bytes.extend_from_slice(&self.header.to_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }
}

/// 数据包错误类型
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u8),

    #[error("Unknown packet type: {0}")]
    UnknownPacketType(u8),

    #[error("Unexpected packet type: expected {expected:?}, got {actual:?}")]
    UnexpectedPacketType {
        expected: PacketType,
        actual: PacketType,
    },

    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Unknown message: {0}")]
    UnknownMessage(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<PacketError> for TransportError {
    fn from(error: PacketError) -> Self {
        TransportError::protocol_error("packet", error.to_string())
    }
}
