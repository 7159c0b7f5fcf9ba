//! # 服务层
//!
//! ## 设计思路
//!
//! `CompositeService` 是给上层（HTTP 接口、任务队列等）持有的长生命周期状态，
//! 在 `CompositeHandler` 之上补充按请求 id 取消的能力。
//!
//! ## 实现思路
//!
//! - 每个请求注册一个 `CancelToken`，请求结束（包括 future 被丢弃）时自动注销
//! - `cancel(request_id)` 触发对应令牌，在途下载与渲染随之中止
//! - 缩放档位读写直接转发给 handler

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{
    CancelToken, Card, CompositeArtifact, CompositeConfig, CompositeError, CompositeHandler,
    MarkupRenderer, PageDecoder,
};

type Registry = Arc<Mutex<HashMap<String, CancelToken>>>;

pub struct CompositeService {
    handler: CompositeHandler,
    cancel_tokens: Registry,
}

impl CompositeService {
    /// 使用默认配置与默认渲染引擎创建服务。
    ///
    /// # 示例
    /// ```rust,no_run
    /// use card_composite::composite::CompositeService;
    ///
    /// let service = CompositeService::new()?;
    /// # Ok::<(), card_composite::composite::CompositeError>(())
    /// ```
    pub fn new() -> Result<Self, CompositeError> {
        Self::with_config(CompositeConfig::default())
    }

    pub fn with_config(config: CompositeConfig) -> Result<Self, CompositeError> {
        Ok(Self::from_handler(CompositeHandler::new(config)?))
    }

    pub fn with_engines(
        config: CompositeConfig,
        renderer: Arc<dyn MarkupRenderer>,
        decoder: Arc<dyn PageDecoder>,
    ) -> Result<Self, CompositeError> {
        Ok(Self::from_handler(CompositeHandler::with_engines(
            config, renderer, decoder,
        )?))
    }

    pub fn from_handler(handler: CompositeHandler) -> Self {
        Self {
            handler,
            cancel_tokens: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// 以 `request_id` 登记并执行一次合成。
    ///
    /// # 示例
    /// ```rust,no_run
    /// use card_composite::composite::{Card, CardFace, CompositeService};
    ///
    /// # async fn demo() -> Result<(), card_composite::composite::CompositeError> {
    /// let service = CompositeService::new()?;
    /// let cards = vec![Card::image("front", CardFace::Front, "https://example.com/front.png")];
    /// let artifact = service.generate("req-1", &cards).await?;
    /// println!("{} ({} bytes)", artifact.file_name, artifact.content.len());
    /// # Ok(())
    /// # }
    /// ```
    pub async fn generate(&self, request_id: &str, cards: &[Card]) -> Result<CompositeArtifact, CompositeError> {
        let token = CancelToken::new();
        let _registration = Registration::register(&self.cancel_tokens, request_id, token.clone())?;

        let result = self.handler.generate_composite(cards, &token).await;

        match &result {
            Ok(artifact) => log::info!(
                "📦 请求 {} 完成 - 文件: {} 卡片: {}",
                request_id,
                artifact.file_name,
                artifact.card_count
            ),
            Err(err) => log::warn!("请求 {} 失败 - code: {} 原因: {}", request_id, err.code(), err),
        }

        result
    }

    /// 以 `request_id` 登记并生成 PDF，取消语义与 `generate` 相同。
    pub async fn generate_pdf(&self, request_id: &str, cards: &[Card]) -> Result<CompositeArtifact, CompositeError> {
        let token = CancelToken::new();
        let _registration = Registration::register(&self.cancel_tokens, request_id, token.clone())?;

        let result = self.handler.generate_pdf(cards, &token).await;

        match &result {
            Ok(artifact) => log::info!(
                "📦 请求 {} 完成 - 文件: {} 大小: {} 字节",
                request_id,
                artifact.file_name,
                artifact.content.len()
            ),
            Err(err) => log::warn!("请求 {} 失败 - code: {} 原因: {}", request_id, err.code(), err),
        }

        result
    }

    /// 取消进行中的请求。请求不存在（已结束或从未开始）时返回 `false`。
    pub fn cancel(&self, request_id: &str) -> Result<bool, CompositeError> {
        let guard = self
            .cancel_tokens
            .lock()
            .map_err(|_| CompositeError::Internal("取消令牌表锁已中毒".to_string()))?;

        if let Some(token) = guard.get(request_id) {
            token.cancel();
            log::info!("🛑 已请求取消合成 - id: {}", request_id);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// 当前进行中的请求数。
    pub fn in_flight(&self) -> usize {
        self.cancel_tokens.lock().map(|guard| guard.len()).unwrap_or(0)
    }

    pub fn set_resize_profile(&self, profile: &str) -> Result<(), CompositeError> {
        self.handler.set_resize_profile(profile)
    }

    pub fn resize_profile(&self) -> String {
        self.handler.resize_profile().as_str().to_string()
    }
}

/// 请求登记凭据，离开作用域时从表中移除。
struct Registration {
    registry: Registry,
    request_id: String,
}

impl Registration {
    fn register(registry: &Registry, request_id: &str, token: CancelToken) -> Result<Self, CompositeError> {
        let mut guard = registry
            .lock()
            .map_err(|_| CompositeError::Internal("取消令牌表锁已中毒".to_string()))?;

        if guard.contains_key(request_id) {
            return Err(CompositeError::DuplicateRequest(request_id.to_string()));
        }
        guard.insert(request_id.to_string(), token);

        Ok(Self {
            registry: Arc::clone(registry),
            request_id: request_id.to_string(),
        })
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut guard = match self.registry.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.remove(&self.request_id);
    }
}
