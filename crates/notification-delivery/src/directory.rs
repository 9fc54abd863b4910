//! 订阅者目录
//!
//! 把通知类别解析为接收方列表。结果可能包含重复项，引擎不做去重。

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use thiserror::Error;

use crate::message::Recipient;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("未知的通知类别: {0}")]
    UnknownClass(String),

    #[error("订阅者目录不可用: {0}")]
    Backend(String),
}

/// 订阅者目录接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SubscriberDirectory: Send + Sync {
    async fn resolve(&self, notification_class: &str) -> Result<Vec<Recipient>, DirectoryError>;
}

/// 内存实现
///
/// 只有登记过的类别才是已知类别，登记为空列表的类别解析为空。
#[derive(Debug, Default)]
pub struct InMemorySubscriberDirectory {
    classes: RwLock<HashMap<String, Vec<Recipient>>>,
}

impl InMemorySubscriberDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从配置中的 类别 → 接收方 映射构建
    pub fn from_map(map: &HashMap<String, Vec<String>>) -> Self {
        let classes = map
            .iter()
            .map(|(class, ids)| {
                (
                    class.clone(),
                    ids.iter().cloned().map(Recipient::from).collect(),
                )
            })
            .collect();
        Self {
            classes: RwLock::new(classes),
        }
    }

    /// 登记一个类别（可为空）
    pub fn register_class(&self, class: impl Into<String>) {
        self.classes.write().entry(class.into()).or_default();
    }

    pub fn subscribe(&self, class: impl Into<String>, recipient: impl Into<Recipient>) {
        self.classes
            .write()
            .entry(class.into())
            .or_default()
            .push(recipient.into());
    }

    /// 移除该类别下所有匹配的接收方，返回是否有移除
    pub fn unsubscribe(&self, class: &str, recipient: &Recipient) -> bool {
        let mut classes = self.classes.write();
        match classes.get_mut(class) {
            Some(list) => {
                let before = list.len();
                list.retain(|r| r != recipient);
                list.len() != before
            }
            None => false,
        }
    }
}

#[async_trait]
impl SubscriberDirectory for InMemorySubscriberDirectory {
    async fn resolve(&self, notification_class: &str) -> Result<Vec<Recipient>, DirectoryError> {
        self.classes
            .read()
            .get(notification_class)
            .cloned()
            .ok_or_else(|| DirectoryError::UnknownClass(notification_class.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_unknown_class() {
        let dir = InMemorySubscriberDirectory::new();
        let err = dir.resolve("alerts").await.unwrap_err();
        assert!(matches!(err, DirectoryError::UnknownClass(c) if c == "alerts"));
    }

    #[tokio::test]
    async fn test_registered_empty_class_resolves_empty() {
        let dir = InMemorySubscriberDirectory::new();
        dir.register_class("alerts");
        assert!(dir.resolve("alerts").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicates_are_preserved() {
        let dir = InMemorySubscriberDirectory::new();
        dir.subscribe("alerts", "1");
        dir.subscribe("alerts", "2");
        dir.subscribe("alerts", "1");

        let recipients = dir.resolve("alerts").await.unwrap();
        assert_eq!(recipients.len(), 3);

        assert!(dir.unsubscribe("alerts", &Recipient::from("1")));
        assert_eq!(dir.resolve("alerts").await.unwrap(), vec![Recipient::from("2")]);
        assert!(!dir.unsubscribe("missing", &Recipient::from("1")));
    }

    #[tokio::test]
    async fn test_from_map() {
        let mut map = HashMap::new();
        map.insert("errors".to_string(), vec!["10".to_string(), "11".to_string()]);
        let dir = InMemorySubscriberDirectory::from_map(&map);
        assert_eq!(
            dir.resolve("errors").await.unwrap(),
            vec![Recipient::from("10"), Recipient::from("11")]
        );
    }
}
