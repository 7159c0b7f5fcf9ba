//! # 卡片合成模块（composite）
//!
//! ## 设计思路
//!
//! 把一批来源各异的卡片（URL 图片、Base64 图片、HTML 标记）合成为一张纵向堆叠的图片。
//! 单张卡片失败只会让它从产物中消失，不会中断整批请求。
//!
//! - `service`：长生命周期状态，按请求 id 取消、切换缩放档位
//! - `handler`：编排整次请求（超时、空结果判定、阶段耗时日志）
//! - `collector`：两个有界 worker 池并发采集位图
//! - `loader`：URL/Base64 加载与安全校验
//! - `markup` / `render`：HTML 渲染为单页文档再栅格化
//! - `compositor`：槽位几何与绘制
//! - `pipeline`：解码限额、缩放、编码
//! - `pool` / `cancel`：并发原语
//! - `config` / `error` / `card`：配置、错误、数据模型
//!
//! ## 调用链
//!
//! ```text
//! CompositeService::generate(request_id, cards)
//!    ↓
//! CompositeHandler::generate_composite（请求超时 + 耗时统计）
//!    ↓
//! ConcurrentCollector::collect
//!    ├─ fetch 池：SourceLoader::load（URL / Base64 → 位图）
//!    └─ render 池：MarkupRenderBatcher::render_all（HTML → 页面 → 位图）
//!    ↓
//! Compositor::compose（等比缩放 + 纵向堆叠）
//!    ↓
//! encode_canvas → CompositeArtifact
//!
//! CompositeService::generate_pdf(request_id, cards)
//!    ↓
//! CompositeHandler::generate_pdf → build_pdf_document → MarkupRenderer::render_document
//! ```

mod cancel;
mod card;
mod collector;
mod compositor;
mod config;
mod error;
mod handler;
mod loader;
mod markup;
mod pipeline;
mod pool;
mod render;
mod service;

pub use cancel::CancelToken;
pub use card::{Bitmap, Card, CardFace, CardKind, CollectedSet, is_url};
pub use collector::ConcurrentCollector;
pub use compositor::{Compositor, Placement};
pub use config::{CompositeConfig, OutputFormat, RendererConfig, ResizeProfile, SlotLayout};
pub use error::{CardError, CompositeError};
pub use handler::{CompositeArtifact, CompositeHandler};
pub use loader::SourceLoader;
pub use markup::{MarkupBatch, MarkupRenderBatcher};
pub use render::{
    MarkupRenderer, PageBytes, PageDecoder, PdftoppmDecoder, WkhtmltopdfRenderer,
    build_card_document, build_pdf_document,
};
pub use service::CompositeService;
