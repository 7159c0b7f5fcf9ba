//! # 并发采集器
//!
//! ## 设计思路
//!
//! 采集阶段把一批卡片变成一组位图，单张失败只记录、不传播。
//!
//! ## 实现思路
//!
//! 1. 按类型分区：直接类型（URL / Base64）与 HTML
//! 2. 直接类型进入 `fetch_workers` 大小的池，结果追加到互斥保护的 `CollectedSet`
//! 3. 直接池全部结束后，HTML 卡片交给渲染批处理（独立的 `render_workers` 池）
//! 4. 合并后冻结结果；若期间收到取消信号，整体返回 `Cancelled`

use std::sync::{Arc, Mutex};
use std::time::Instant;

use super::loader::SourceLoader;
use super::markup::MarkupRenderBatcher;
use super::pool::run_bounded;
use super::{CancelToken, Card, CollectedSet, CompositeError};

pub struct ConcurrentCollector {
    loader: Arc<SourceLoader>,
    batcher: MarkupRenderBatcher,
    fetch_workers: usize,
}

impl ConcurrentCollector {
    pub fn new(loader: Arc<SourceLoader>, batcher: MarkupRenderBatcher, fetch_workers: usize) -> Self {
        Self {
            loader,
            batcher,
            fetch_workers: fetch_workers.max(1),
        }
    }

    /// 采集所有卡片。只有取消时才返回错误，空结果由调用方判定。
    pub async fn collect(&self, cards: &[Card], cancel: &CancelToken) -> Result<CollectedSet, CompositeError> {
        let (direct, markup): (Vec<Card>, Vec<Card>) =
            cards.iter().cloned().partition(|card| card.kind.is_direct());

        log::info!(
            "📥 开始采集卡片 - 直接加载: {} HTML: {} 并发: {}",
            direct.len(),
            markup.len(),
            self.fetch_workers
        );

        let started = Instant::now();
        let set = Arc::new(Mutex::new(CollectedSet::new()));
        let sink = Arc::clone(&set);
        let loader = Arc::clone(&self.loader);

        let report = run_bounded("fetch", direct, self.fetch_workers, cancel, move |card: Card| {
            let loader = Arc::clone(&loader);
            let sink = Arc::clone(&sink);
            async move {
                let result = loader.load(&card).await;
                let mut guard = match sink.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                match result {
                    Ok(bitmap) => guard.push(bitmap),
                    Err(err) => {
                        log::warn!(
                            "⚠️ 卡片加载失败 - id: {} face: {} code: {} 阶段: {} 原因: {}",
                            card.id,
                            card.face,
                            err.code(),
                            err.stage(),
                            err
                        );
                        guard.record_failure();
                    }
                }
            }
        })
        .await;

        log::debug!(
            "📥 直接加载阶段结束 - worker: {} 异常: {} 耗时: {:?}",
            report.workers,
            report.panicked,
            started.elapsed()
        );

        if cancel.is_cancelled() {
            return Err(CompositeError::Cancelled("采集阶段收到取消信号".to_string()));
        }

        let mut set = take_set(set);
        // panic 的任务对应的卡片既未成功也未记录失败
        for _ in 0..report.panicked {
            set.record_failure();
        }

        if !markup.is_empty() {
            let batch = self.batcher.render_all(markup, cancel).await;

            if cancel.is_cancelled() {
                return Err(CompositeError::Cancelled("渲染阶段收到取消信号".to_string()));
            }

            let failed = batch.failed_count();
            for bitmap in batch.bitmaps {
                set.push(bitmap);
            }
            for (id, face, err) in &batch.errors {
                log::warn!(
                    "⚠️ HTML 卡片渲染失败 - id: {} face: {} code: {} 阶段: {} 原因: {}",
                    id,
                    face,
                    err.code(),
                    err.stage(),
                    err
                );
            }
            for _ in 0..failed {
                set.record_failure();
            }
        }

        log::info!(
            "📥 采集完成 - 成功: {} 失败: {} 耗时: {:?}",
            set.len(),
            set.failures(),
            started.elapsed()
        );
        Ok(set)
    }
}

fn take_set(set: Arc<Mutex<CollectedSet>>) -> CollectedSet {
    match Arc::try_unwrap(set) {
        Ok(mutex) => mutex.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner()),
        Err(shared) => {
            let mut guard = match shared.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::take(&mut *guard)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composite::pipeline::tests::create_png_bytes;
    use crate::composite::{Bitmap, CardError, CardFace, CompositeConfig, MarkupRenderer, PageBytes, PageDecoder};
    use async_trait::async_trait;
    use base64::{Engine as _, engine::general_purpose};
    use image::Rgba;

    struct StubRenderer;

    #[async_trait]
    impl MarkupRenderer for StubRenderer {
        async fn render_page(&self, markup: &str) -> Result<PageBytes, CardError> {
            if markup.is_empty() {
                return Err(CardError::Render("empty markup".to_string()));
            }
            Ok(PageBytes::new(markup.as_bytes().to_vec()))
        }
    }

    struct StubDecoder;

    #[async_trait]
    impl PageDecoder for StubDecoder {
        async fn decode_page(&self, _page: &PageBytes, _page_index: usize) -> Result<Bitmap, CardError> {
            Ok(Bitmap::from_pixel(850, 1100, Rgba([255, 0, 0, 255])))
        }
    }

    fn collector() -> ConcurrentCollector {
        let config = CompositeConfig::default();
        let loader = SourceLoader::new(config.clone()).expect("loader init failed");
        let batcher = MarkupRenderBatcher::new(Arc::new(StubRenderer), Arc::new(StubDecoder), config.render_workers);
        ConcurrentCollector::new(Arc::new(loader), batcher, config.fetch_workers)
    }

    fn png_b64(width: u32, height: u32) -> String {
        general_purpose::STANDARD.encode(create_png_bytes(width, height))
    }

    #[tokio::test]
    async fn collects_direct_and_markup_cards() {
        let cards = vec![
            Card::image("a", CardFace::Front, png_b64(100, 60)),
            Card::image("b", CardFace::Back, png_b64(60, 100)),
            Card::markup("c", CardFace::Combined, "<p>c</p>"),
        ];

        let set = collector()
            .collect(&cards, &CancelToken::new())
            .await
            .expect("collect should succeed");

        assert_eq!(set.len(), 3);
        assert_eq!(set.failures(), 0);

        let mut dims: Vec<(u32, u32)> = set.bitmaps().iter().map(|b| b.dimensions()).collect();
        dims.sort_unstable();
        assert_eq!(dims, vec![(60, 100), (100, 60), (850, 1100)]);
    }

    #[tokio::test]
    async fn failed_cards_are_counted_not_propagated() {
        let cards = vec![
            Card::image("ok", CardFace::Front, png_b64(20, 20)),
            Card::new("bad-b64", crate::composite::CardKind::Base64, CardFace::Front, "%%%"),
            Card::image("not-image", CardFace::Back, "SGVsbG8="),
            Card::markup("bad-html", CardFace::Front, ""),
        ];

        let set = collector()
            .collect(&cards, &CancelToken::new())
            .await
            .expect("per-card failures must not fail collection");

        assert_eq!(set.len(), 1);
        assert_eq!(set.failures(), 3);
    }

    struct CrashingRenderer;

    #[async_trait]
    impl MarkupRenderer for CrashingRenderer {
        async fn render_page(&self, _markup: &str) -> Result<PageBytes, CardError> {
            panic!("renderer process crashed");
        }
    }

    #[tokio::test]
    async fn panicking_markup_render_counts_as_failure() {
        let config = CompositeConfig::default();
        let loader = SourceLoader::new(config.clone()).expect("loader init failed");
        let batcher = MarkupRenderBatcher::new(Arc::new(CrashingRenderer), Arc::new(StubDecoder), 1);
        let collector = ConcurrentCollector::new(Arc::new(loader), batcher, config.fetch_workers);

        let cards = vec![
            Card::image("ok", CardFace::Front, png_b64(30, 20)),
            Card::markup("crash", CardFace::Back, "<p>boom</p>"),
        ];

        let set = collector
            .collect(&cards, &CancelToken::new())
            .await
            .expect("a crashing renderer must not fail collection");

        assert_eq!(set.len(), 1);
        assert_eq!(set.failures(), 1);
    }

    #[tokio::test]
    async fn empty_input_yields_empty_set() {
        let set = collector()
            .collect(&[], &CancelToken::new())
            .await
            .expect("empty collect should succeed");

        assert!(set.is_empty());
        assert_eq!(set.failures(), 0);
    }

    #[tokio::test]
    async fn pre_cancelled_token_returns_cancelled() {
        let cancel = CancelToken::new();
        cancel.cancel();

        let cards = vec![Card::image("a", CardFace::Front, png_b64(10, 10))];
        let result = collector().collect(&cards, &cancel).await;

        assert!(matches!(result, Err(CompositeError::Cancelled(_))));
    }
}
