//! # 卡片合成流水线：库入口
//!
//! ## 架构总览
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  调用方（HTTP 接口 / 任务队列 / 测试）                    │
//! │       │ Vec<Card> + request_id                          │
//! └───────┼──────────────────────────────────────────────────┘
//!         ↓ Result<CompositeArtifact, CompositeError>
//! ┌───────┼──────────────────────────────────────────────────┐
//! │  composite::service   取消表 + 档位切换                  │
//! │  composite::handler   超时 · 空结果判定 · 编码 · 命名     │
//! │       │                                                  │
//! │  composite::collector                                    │
//! │   ├─ fetch 池 (W=10)   loader → pipeline::decode_raster  │
//! │   └─ render 池 (R=4)   markup → render (wkhtmltopdf,     │
//! │                                  pdftoppm)               │
//! │       │                                                  │
//! │  composite::compositor  1012x638 槽位纵向堆叠            │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## 模块职责
//!
//! | 模块 | 职责 |
//! |------|------|
//! | [`composite`] | 卡片加载、HTML 渲染、并发采集、合成与编码 |

pub mod composite;
