//! 文本切分
//!
//! 按 Unicode 标量（字符）做贪心定长切分：按序拼接全部分段即可还原原文，
//! 每段不超过 `max_len` 个字符。切分结果超过分段上限时整体拒绝，
//! 调用方不会发出残缺的广播。

use notifier_shared::config::DeliveryConfig;

use crate::error::DeliveryError;
use crate::message::{Message, Segment, assemble_segments};

/// 切分文本
///
/// 空文本返回空列表；`max_len = 0` 视为配置错误。
pub fn split(text: &str, max_len: usize, max_segments: usize) -> Result<Vec<String>, DeliveryError> {
    if max_len == 0 {
        return Err(DeliveryError::InvalidConfiguration(
            "max_segment_len 必须大于 0".to_string(),
        ));
    }

    let char_count = text.chars().count();
    let needed = char_count.div_ceil(max_len);
    if needed > max_segments {
        return Err(DeliveryError::OversizeMessage {
            segments: needed,
            limit: max_segments,
        });
    }

    let mut chunks = Vec::with_capacity(needed);
    let mut start = 0;
    let mut taken = 0;
    for (offset, _) in text.char_indices() {
        if taken == max_len {
            chunks.push(text[start..offset].to_string());
            start = offset;
            taken = 0;
        }
        taken += 1;
    }
    if start < text.len() {
        chunks.push(text[start..].to_string());
    }

    Ok(chunks)
}

/// 绑定了分段长度与上限的切分器
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextChunker {
    max_len: usize,
    max_segments: usize,
}

impl TextChunker {
    pub fn new(max_len: usize, max_segments: usize) -> Result<Self, DeliveryError> {
        if max_len == 0 {
            return Err(DeliveryError::InvalidConfiguration(
                "max_segment_len 必须大于 0".to_string(),
            ));
        }
        if max_segments == 0 {
            return Err(DeliveryError::InvalidConfiguration(
                "max_segments 必须大于 0".to_string(),
            ));
        }
        Ok(Self {
            max_len,
            max_segments,
        })
    }

    pub fn from_config(config: &DeliveryConfig) -> Result<Self, DeliveryError> {
        Self::new(config.max_segment_len, config.max_segments)
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn max_segments(&self) -> usize {
        self.max_segments
    }

    pub fn split(&self, text: &str) -> Result<Vec<String>, DeliveryError> {
        split(text, self.max_len, self.max_segments)
    }

    /// 切分消息并组装分段；空文本返回 [`DeliveryError::EmptyMessage`]
    pub fn segments(&self, message: &Message) -> Result<Vec<Segment>, DeliveryError> {
        let chunks = self.split(&message.text)?;
        if chunks.is_empty() {
            return Err(DeliveryError::EmptyMessage);
        }
        Ok(assemble_segments(message, chunks))
    }
}

impl Default for TextChunker {
    fn default() -> Self {
        Self {
            max_len: 4096,
            max_segments: 50,
        }
    }
}
