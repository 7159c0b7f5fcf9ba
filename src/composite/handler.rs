//! # 合成入口
//!
//! `CompositeHandler` 串联一次完整请求：
//! 采集（受请求超时约束） → 空结果判定 → 合成 → 编码 → 生成文件名。
//!
//! `generate_pdf` 走另一条路径：整批卡片拼成一份 HTML 文档，交给渲染引擎一次性输出 PDF。
//!
//! 配置以快照方式读取：请求开始时复制一份，运行期间修改配置不影响在途请求。

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::Local;

use super::collector::ConcurrentCollector;
use super::compositor::Compositor;
use super::loader::{SourceLoader, build_http_client};
use super::markup::MarkupRenderBatcher;
use super::pipeline::encode_canvas;
use super::render::{MarkupRenderer, PageDecoder, PdftoppmDecoder, WkhtmltopdfRenderer, build_pdf_document};
use super::{CancelToken, Card, CompositeConfig, CompositeError, OutputFormat, ResizeProfile};

/// 一次合成的产物。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositeArtifact {
    /// 编码后的图片或 PDF 字节。
    pub content: Vec<u8>,
    /// `id_cards_YYYYMMDD_HHMMSS.<ext>`
    pub file_name: String,
    pub format: OutputFormat,
    /// 画布宽高；PDF 产物不经过画布，均为 0。
    pub width: u32,
    pub height: u32,
    /// 实际合成的卡片数。
    pub card_count: usize,
    /// 被丢弃的卡片数。
    pub failed_count: usize,
}

impl CompositeArtifact {
    pub fn mime_type(&self) -> &'static str {
        self.format.mime_type()
    }
}

fn artifact_file_name(format: OutputFormat) -> String {
    format!(
        "id_cards_{}.{}",
        Local::now().format("%Y%m%d_%H%M%S"),
        format.extension()
    )
}

pub struct CompositeHandler {
    config: Arc<RwLock<CompositeConfig>>,
    client: reqwest::Client,
    renderer: Arc<dyn MarkupRenderer>,
    decoder: Arc<dyn PageDecoder>,
}

impl CompositeHandler {
    /// 使用默认渲染引擎（wkhtmltopdf + pdftoppm）。
    pub fn new(config: CompositeConfig) -> Result<Self, CompositeError> {
        let renderer = Arc::new(WkhtmltopdfRenderer::new(config.renderer.clone()));
        let decoder = Arc::new(PdftoppmDecoder::new(config.renderer.clone()));
        Self::with_engines(config, renderer, decoder)
    }

    /// 注入自定义渲染引擎。
    pub fn with_engines(
        config: CompositeConfig,
        renderer: Arc<dyn MarkupRenderer>,
        decoder: Arc<dyn PageDecoder>,
    ) -> Result<Self, CompositeError> {
        config.validate()?;
        let client = build_http_client(&config)?;

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            client,
            renderer,
            decoder,
        })
    }

    /// 当前配置快照。
    pub fn config_snapshot(&self) -> CompositeConfig {
        match self.config.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// 运行时切换缩放档位，对后续请求生效。
    pub fn set_resize_profile(&self, profile: &str) -> Result<(), CompositeError> {
        let profile = ResizeProfile::from_str(profile)?;

        let mut guard = match self.config.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.apply_resize_profile(profile);

        log::info!("⚙️ 缩放档位已切换为: {}", profile.as_str());
        Ok(())
    }

    pub fn resize_profile(&self) -> ResizeProfile {
        self.config_snapshot().resize_profile
    }

    /// 生成合成图。
    ///
    /// 单张卡片失败只会减少产物中的卡片数；全部失败返回 `NoResolvableContent`，
    /// 取消或超时返回 `Cancelled`，不会产出部分结果。
    pub async fn generate_composite(
        &self,
        cards: &[Card],
        cancel: &CancelToken,
    ) -> Result<CompositeArtifact, CompositeError> {
        let config = self.config_snapshot();
        let total_start = Instant::now();

        log::info!("🚀 开始生成合成图 - 卡片数: {}", cards.len());

        let loader = Arc::new(SourceLoader::with_client(self.client.clone(), config.clone()));
        let batcher = MarkupRenderBatcher::new(
            Arc::clone(&self.renderer),
            Arc::clone(&self.decoder),
            config.render_workers,
        );
        let collector = ConcurrentCollector::new(loader, batcher, config.fetch_workers);

        // 阶段 1：采集
        let collect_start = Instant::now();
        let request_timeout = Duration::from_millis(config.request_timeout_ms);
        let collected = match tokio::time::timeout(request_timeout, collector.collect(cards, cancel)).await {
            Ok(result) => result?,
            Err(_) => {
                cancel.cancel();
                log::warn!("⏱️ 合成请求超时（{} 毫秒），已取消在途任务", config.request_timeout_ms);
                return Err(CompositeError::Cancelled(format!(
                    "请求超时（{} 毫秒）",
                    config.request_timeout_ms
                )));
            }
        };
        let collect_elapsed = collect_start.elapsed();

        if cancel.is_cancelled() {
            return Err(CompositeError::Cancelled("合成前收到取消信号".to_string()));
        }

        if collected.is_empty() {
            log::error!("❌ 没有任何卡片可用 - 提交: {} 失败: {}", cards.len(), collected.failures());
            return Err(CompositeError::NoResolvableContent {
                submitted: cards.len(),
            });
        }

        let card_count = collected.len();
        let failed_count = collected.failures();
        let compositor = Compositor::new(config.layout, config.resize_profile);
        let output_format = config.output_format;

        // 阶段 2/3：合成与编码均为 CPU 密集型，放到阻塞线程池
        let (canvas_dims, content, compose_elapsed, encode_elapsed) = tokio::task::spawn_blocking(move || {
            let compose_start = Instant::now();
            let canvas = compositor.compose(collected.into_bitmaps())?;
            let compose_elapsed = compose_start.elapsed();
            let dims = canvas.dimensions();

            let encode_start = Instant::now();
            let content = encode_canvas(canvas, output_format)?;
            Ok::<_, CompositeError>((dims, content, compose_elapsed, encode_start.elapsed()))
        })
        .await
        .map_err(|e| CompositeError::Internal(format!("合成任务异常退出：{}", e)))??;

        let file_name = artifact_file_name(output_format);

        log::info!(
            "✅ 合成图生成完成 - 文件: {} 尺寸: {}x{} 卡片: {} 失败: {} 大小: {} 字节",
            file_name,
            canvas_dims.0,
            canvas_dims.1,
            card_count,
            failed_count,
            content.len()
        );
        log::info!(
            "⏱️ 耗时统计 - 采集: {:?} 合成: {:?} 编码: {:?} 总计: {:?}",
            collect_elapsed,
            compose_elapsed,
            encode_elapsed,
            total_start.elapsed()
        );

        Ok(CompositeArtifact {
            content,
            file_name,
            format: output_format,
            width: canvas_dims.0,
            height: canvas_dims.1,
            card_count,
            failed_count,
        })
    }

    /// 生成包含全部卡片的 PDF。
    ///
    /// 卡片不在本地加载：图片地址与 HTML 原样写入文档，由渲染引擎一次性排版，
    /// 因此 `card_count` 为提交数、`failed_count` 恒为 0。渲染失败返回 `Render`，
    /// 取消或超时返回 `Cancelled`。
    pub async fn generate_pdf(
        &self,
        cards: &[Card],
        cancel: &CancelToken,
    ) -> Result<CompositeArtifact, CompositeError> {
        let config = self.config_snapshot();
        let started = Instant::now();

        if cards.is_empty() {
            return Err(CompositeError::NoResolvableContent { submitted: 0 });
        }

        log::info!("🚀 开始生成 PDF - 卡片数: {}", cards.len());

        let document = build_pdf_document(cards);
        let request_timeout = Duration::from_millis(config.request_timeout_ms);
        let rendered = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(CompositeError::Cancelled("PDF 渲染期间收到取消信号".to_string()));
            }
            rendered = tokio::time::timeout(request_timeout, self.renderer.render_document(&document)) => rendered,
        };

        let page = match rendered {
            Ok(result) => result.map_err(|e| {
                log::error!("❌ PDF 渲染失败 - code: {} 原因: {}", e.code(), e);
                CompositeError::Render(e.to_string())
            })?,
            Err(_) => {
                cancel.cancel();
                log::warn!("⏱️ PDF 请求超时（{} 毫秒），已取消", config.request_timeout_ms);
                return Err(CompositeError::Cancelled(format!(
                    "请求超时（{} 毫秒）",
                    config.request_timeout_ms
                )));
            }
        };

        if page.is_empty() {
            return Err(CompositeError::Render("渲染引擎未输出任何内容".to_string()));
        }

        let file_name = artifact_file_name(OutputFormat::Pdf);
        log::info!(
            "✅ PDF 生成完成 - 文件: {} 卡片: {} 大小: {} 字节 耗时: {:?}",
            file_name,
            cards.len(),
            page.len(),
            started.elapsed()
        );

        Ok(CompositeArtifact {
            content: page.as_bytes().to_vec(),
            file_name,
            format: OutputFormat::Pdf,
            width: 0,
            height: 0,
            card_count: cards.len(),
            failed_count: 0,
        })
    }
}
