//! # 错误模型模块
//!
//! ## 设计思路
//!
//! 拆成两层错误：
//! - `CardError`：单张卡片在加载/渲染链路中的失败，只在 worker 边界记录日志并丢弃该卡片，
//!   永远不会打断同批次的其他卡片。
//! - `CompositeError`：整次合成请求的失败，会返回给调用方。
//!
//! 通过 `thiserror` 保持人类可读错误，同时提供稳定的 `code()` / `stage()` 便于日志检索。

/// 单张卡片处理错误。
#[derive(Debug, thiserror::Error)]
pub enum CardError {
    #[error("网络错误：{0}")]
    Fetch(String),

    #[error("Base64 编码错误：{0}")]
    Encoding(String),

    #[error("解码错误：{0}")]
    Decode(String),

    #[error("渲染错误：{0}")]
    Render(String),

    #[error("页面解码错误：{0}")]
    PageDecode(String),

    #[error("资源限制：{0}")]
    ResourceLimit(String),

    #[error("不支持的卡片类型：{0}")]
    Unsupported(String),

    #[error("已取消：{0}")]
    Cancelled(String),
}

impl CardError {
    /// 稳定错误码，供日志检索与上层统计。
    pub fn code(&self) -> &'static str {
        match self {
            Self::Fetch(_) => "E_FETCH",
            Self::Encoding(_) => "E_ENCODING",
            Self::Decode(_) => "E_DECODE",
            Self::Render(_) => "E_RENDER",
            Self::PageDecode(_) => "E_PAGE_DECODE",
            Self::ResourceLimit(_) => "E_RESOURCE_LIMIT",
            Self::Unsupported(_) => "E_UNSUPPORTED",
            Self::Cancelled(_) => "E_CANCELLED",
        }
    }

    /// 失败发生的处理阶段。
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Fetch(_) => "fetch",
            Self::Encoding(_) => "base64",
            Self::Decode(_) | Self::ResourceLimit(_) => "decode",
            Self::Render(_) => "render",
            Self::PageDecode(_) => "page_decode",
            Self::Unsupported(_) => "route",
            Self::Cancelled(_) => "cancel",
        }
    }
}

/// 合成请求级错误。
#[derive(Debug, thiserror::Error)]
pub enum CompositeError {
    #[error("没有可用的卡片图像（提交 {submitted} 张，全部失败或为空）")]
    NoResolvableContent { submitted: usize },

    #[error("合成输入为空")]
    EmptyInput,

    #[error("请求已取消：{0}")]
    Cancelled(String),

    #[error("编码错误：{0}")]
    Encode(String),

    #[error("文档渲染失败：{0}")]
    Render(String),

    #[error("请求 {0} 正在处理中")]
    DuplicateRequest(String),

    #[error("配置错误：{0}")]
    Config(String),

    #[error("内部错误：{0}")]
    Internal(String),
}

impl CompositeError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoResolvableContent { .. } => "E_NO_CONTENT",
            Self::EmptyInput => "E_EMPTY_INPUT",
            Self::Cancelled(_) => "E_CANCELLED",
            Self::Encode(_) => "E_ENCODE",
            Self::Render(_) => "E_RENDER",
            Self::DuplicateRequest(_) => "E_DUPLICATE_REQUEST",
            Self::Config(_) => "E_CONFIG",
            Self::Internal(_) => "E_INTERNAL",
        }
    }
}

impl From<CompositeError> for String {
    fn from(error: CompositeError) -> Self {
        error.to_string()
    }
}
