//! # HTML 卡片渲染批处理
//!
//! 每张 HTML 卡片独立走“渲染 → 取第 0 页 → 位图”，互不影响。
//! 渲染开销远高于下载，因此使用独立且更小的 worker 池。

use std::sync::{Arc, Mutex};

use super::pool::run_bounded;
use super::render::{MarkupRenderer, PageDecoder};
use super::{Bitmap, CancelToken, Card, CardError, CardFace};

/// 渲染批处理结果。
///
/// 顺序与输入无关。
#[derive(Debug, Default)]
pub struct MarkupBatch {
    pub bitmaps: Vec<Bitmap>,
    /// `(卡片 id, 展示面, 错误)`
    pub errors: Vec<(String, CardFace, CardError)>,
    /// 渲染或解码过程中 panic 的卡片数，这些卡片不出现在 `bitmaps` 与 `errors` 中。
    pub panicked: usize,
}

impl MarkupBatch {
    /// 未产出位图的卡片总数。
    pub fn failed_count(&self) -> usize {
        self.errors.len() + self.panicked
    }
}

/// HTML 卡片渲染批处理器。
#[derive(Clone)]
pub struct MarkupRenderBatcher {
    renderer: Arc<dyn MarkupRenderer>,
    decoder: Arc<dyn PageDecoder>,
    workers: usize,
}

impl MarkupRenderBatcher {
    pub fn new(renderer: Arc<dyn MarkupRenderer>, decoder: Arc<dyn PageDecoder>, workers: usize) -> Self {
        Self {
            renderer,
            decoder,
            workers: workers.max(1),
        }
    }

    /// 渲染所有 HTML 卡片。单张失败只记入 `errors`。
    pub async fn render_all(&self, cards: Vec<Card>, cancel: &CancelToken) -> MarkupBatch {
        if cards.is_empty() {
            return MarkupBatch::default();
        }

        let total = cards.len();
        let batch = Arc::new(Mutex::new(MarkupBatch::default()));
        let sink = Arc::clone(&batch);
        let renderer = Arc::clone(&self.renderer);
        let decoder = Arc::clone(&self.decoder);

        log::info!("🧾 开始渲染 HTML 卡片 - 数量: {} 并发: {}", total, self.workers);

        let report = run_bounded("render", cards, self.workers, cancel, move |card: Card| {
            let renderer = Arc::clone(&renderer);
            let decoder = Arc::clone(&decoder);
            let sink = Arc::clone(&sink);
            async move {
                let result = render_one(renderer.as_ref(), decoder.as_ref(), &card).await;
                let mut guard = match sink.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                match result {
                    Ok(bitmap) => guard.bitmaps.push(bitmap),
                    Err(err) => guard.errors.push((card.id, card.face, err)),
                }
            }
        })
        .await;

        let mut batch = match Arc::try_unwrap(batch) {
            Ok(mutex) => mutex.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner()),
            Err(shared) => {
                let mut guard = match shared.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                std::mem::take(&mut *guard)
            }
        };
        batch.panicked = report.panicked;

        log::info!(
            "🧾 HTML 渲染结束 - 成功: {} 失败: {} 异常: {} 总数: {}",
            batch.bitmaps.len(),
            batch.errors.len(),
            batch.panicked,
            total
        );
        batch
    }
}

async fn render_one(
    renderer: &dyn MarkupRenderer,
    decoder: &dyn PageDecoder,
    card: &Card,
) -> Result<Bitmap, CardError> {
    let page = renderer.render_page(&card.source).await?;
    decoder.decode_page(&page, 0).await
}
