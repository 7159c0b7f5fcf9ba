//! # 卡片与中间模型
//!
//! ## 设计思路
//!
//! 将“外部输入”和“流水线中间结果”解耦：
//! - `Card` 表示调用方提交的卡片记录，只读
//! - `RawImageData` 表示已加载但未解码的字节
//! - `Bitmap` 表示解码后的 RGBA 像素
//! - `CollectedSet` 表示一次采集的结果（成功位图 + 失败计数）

use std::fmt;

use serde::{Deserialize, Serialize};

/// 解码后的位图（RGBA8）。
pub type Bitmap = image::RgbaImage;

/// 卡片内容类型。
///
/// 封闭枚举：新增类型时编译器会强制所有分派点补齐分支。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CardKind {
    /// 网络图片地址。
    Url,
    /// Base64 图片（支持 Data URL 与纯 Base64 字符串）。
    Base64,
    /// 需要先渲染成页面再栅格化的 HTML 标记。
    Html,
}

impl CardKind {
    /// 是否可由 `SourceLoader` 直接加载（无需渲染）。
    pub fn is_direct(self) -> bool {
        matches!(self, Self::Url | Self::Base64)
    }
}

/// 卡片展示面，仅用于日志与错误上下文。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CardFace {
    Front,
    Back,
    Combined,
}

impl fmt::Display for CardFace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Front => "front",
            Self::Back => "back",
            Self::Combined => "combined",
        };
        f.write_str(label)
    }
}

/// 一张待合成的卡片。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: CardKind,
    pub face: CardFace,
    /// URL、Base64 负载或 HTML 文档，取决于 `kind`。
    pub source: String,
}

impl Card {
    pub fn new(
        id: impl Into<String>,
        kind: CardKind,
        face: CardFace,
        source: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            face,
            source: source.into(),
        }
    }

    /// 构建图片卡片，按来源前缀推断 URL 或 Base64。
    ///
    /// # 示例
    /// ```rust
    /// use card_composite::composite::{Card, CardFace, CardKind};
    ///
    /// let card = Card::image("front", CardFace::Front, "https://example.com/a.png");
    /// assert_eq!(card.kind, CardKind::Url);
    ///
    /// let card = Card::image("back", CardFace::Back, "iVBORw0KGgo=");
    /// assert_eq!(card.kind, CardKind::Base64);
    /// ```
    pub fn image(id: impl Into<String>, face: CardFace, source: impl Into<String>) -> Self {
        let source = source.into();
        let kind = if is_url(&source) {
            CardKind::Url
        } else {
            CardKind::Base64
        };
        Self::new(id, kind, face, source)
    }

    /// 构建 HTML 标记卡片。
    pub fn markup(id: impl Into<String>, face: CardFace, html: impl Into<String>) -> Self {
        Self::new(id, CardKind::Html, face, html)
    }
}

/// 判断字符串是否为 http(s) 地址。
pub fn is_url(source: &str) -> bool {
    let trimmed = source.trim_start();
    trimmed.starts_with("http://") || trimmed.starts_with("https://")
}

/// 加载阶段输出：原始字节与来源标识。
pub(crate) struct RawImageData {
    /// 原始图片字节。
    pub(crate) bytes: Vec<u8>,
    /// 来源提示（用于日志与诊断）。
    pub(crate) source_hint: &'static str,
}

/// 一次采集的结果。
///
/// 采集期间只通过互斥锁追加；worker 全部结束后冻结，交给合成器消费。
/// 位图顺序与提交顺序无关。
#[derive(Debug, Default)]
pub struct CollectedSet {
    pub(crate) bitmaps: Vec<Bitmap>,
    pub(crate) failures: usize,
}

impl CollectedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, bitmap: Bitmap) {
        self.bitmaps.push(bitmap);
    }

    pub(crate) fn record_failure(&mut self) {
        self.failures += 1;
    }

    pub fn len(&self) -> usize {
        self.bitmaps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bitmaps.is_empty()
    }

    pub fn failures(&self) -> usize {
        self.failures
    }

    pub fn bitmaps(&self) -> &[Bitmap] {
        &self.bitmaps
    }

    pub fn into_bitmaps(self) -> Vec<Bitmap> {
        self.bitmaps
    }
}
