//! # 渲染引擎模块
//!
//! ## 设计思路
//!
//! HTML 卡片要经过“HTML → 单页文档 → 位图”两步才能进入合成。两步都依赖外部引擎，
//! 因此抽象为两个能力 trait，流水线只依赖 trait，测试可注入假实现。
//!
//! ## 实现思路
//!
//! - `MarkupRenderer::render_page`：把一段 HTML 包装成完整文档并渲染成一页
//! - `MarkupRenderer::render_document`：渲染一份完整 HTML 文档（PDF 输出使用，可多页）
//! - `PageDecoder::decode_page`：把页面文档的第 N 页栅格化为位图
//! - 默认实现分别调用 `wkhtmltopdf` 与 `pdftoppm`，通过 stdin/stdout 传递数据
//! - 子进程设置 `kill_on_drop(true)`，调用 future 被丢弃（取消）时子进程随之结束

use std::process::Stdio;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{Bitmap, Card, CardError, CardKind, RendererConfig, is_url};

const STDERR_PREVIEW_LIMIT: usize = 512;

/// 渲染后的文档（PDF）。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageBytes(Bytes);

impl PageBytes {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// 将 HTML 渲染为文档。
#[async_trait]
pub trait MarkupRenderer: Send + Sync {
    /// 将 HTML 片段渲染为单页文档。
    async fn render_page(&self, markup: &str) -> Result<PageBytes, CardError>;

    /// 将完整 HTML 文档原样渲染。默认不支持。
    async fn render_document(&self, _document: &str) -> Result<PageBytes, CardError> {
        Err(CardError::Unsupported("当前渲染引擎不支持整份文档渲染".to_string()))
    }
}

/// 将页面文档中的指定页（从 0 开始）栅格化为位图。
#[async_trait]
pub trait PageDecoder: Send + Sync {
    async fn decode_page(&self, page: &PageBytes, page_index: usize) -> Result<Bitmap, CardError>;
}

/// 把卡片 HTML 片段包装为完整文档。
///
/// 样式固定：页面零边距、Arial 字体，卡片与其中图片宽度铺满页面。
pub fn build_card_document(markup: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<style>
body {{
  margin: 0;
  padding: 0;
  font-family: Arial, sans-serif;
}}
.card {{
  width: 100%;
}}
img {{
  width: 100%;
  height: auto;
}}
</style>
</head>
<body>
<div class="card">
{}
</div>
</body>
</html>"#,
        markup
    )
}

/// 把整批卡片拼成一份 HTML 文档，每张卡片一个 `.card` 块，顺序与输入一致。
///
/// HTML 卡片原样内嵌；URL 卡片直接作为 `<img>` 地址，其余内容按 PNG 的 Base64 拼成 Data URL
/// （已是 Data URL 的保持不变）。
pub fn build_pdf_document(cards: &[Card]) -> String {
    let mut body = String::new();
    for card in cards {
        match card.kind {
            CardKind::Html => {
                body.push_str("<div class=\"card\">\n");
                body.push_str(&card.source);
                body.push_str("\n</div>\n");
            }
            CardKind::Url | CardKind::Base64 => {
                let source = card.source.trim();
                let src = if is_url(source) || source.starts_with("data:") {
                    source.to_string()
                } else {
                    format!("data:image/png;base64,{}", source)
                };
                body.push_str(&format!(
                    "<div class=\"card\">\n<img src=\"{}\" alt=\"{} Card\">\n</div>\n",
                    escape_attribute(&src),
                    card.face
                ));
            }
        }
    }

    format!(
        r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<style>
body {{
  margin: 0;
  padding: 0;
  font-family: Arial, sans-serif;
}}
.card {{
  width: 100%;
  margin-bottom: 20px;
}}
img {{
  width: 100%;
  height: auto;
}}
</style>
</head>
<body>
{}</body>
</html>"#,
        body
    )
}

fn escape_attribute(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '"' => escaped.push_str("&quot;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

/// 基于 `wkhtmltopdf` 的渲染器，HTML 从 stdin 输入，PDF 从 stdout 读取。
#[derive(Debug, Clone)]
pub struct WkhtmltopdfRenderer {
    config: RendererConfig,
}

impl WkhtmltopdfRenderer {
    pub fn new(config: RendererConfig) -> Self {
        Self { config }
    }

    fn args(&self) -> Vec<String> {
        let margin = format!("{}mm", self.config.margin_mm);
        vec![
            "--quiet".to_string(),
            "--dpi".to_string(),
            self.config.dpi.to_string(),
            "--page-size".to_string(),
            self.config.page_size.clone(),
            "-T".to_string(),
            margin.clone(),
            "-B".to_string(),
            margin.clone(),
            "-L".to_string(),
            margin.clone(),
            "-R".to_string(),
            margin,
            "-".to_string(),
            "-".to_string(),
        ]
    }
}

#[async_trait]
impl MarkupRenderer for WkhtmltopdfRenderer {
    async fn render_page(&self, markup: &str) -> Result<PageBytes, CardError> {
        self.render_document(&build_card_document(markup)).await
    }

    async fn render_document(&self, document: &str) -> Result<PageBytes, CardError> {
        let document = document.as_bytes().to_vec();

        let mut child = Command::new(&self.config.wkhtmltopdf_bin)
            .args(self.args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                CardError::Render(format!("无法启动 {}：{}", self.config.wkhtmltopdf_bin, e))
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| CardError::Render("无法获取渲染进程 stdin".to_string()))?;

        // stdout 需要与写入并行读取，否则大文档会把管道写满
        let writer = tokio::spawn(async move {
            stdin.write_all(&document).await?;
            stdin.shutdown().await
        });

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| CardError::Render(format!("等待渲染进程失败：{}", e)))?;

        match writer.await {
            Ok(Err(e)) => log::debug!("渲染进程 stdin 写入中断：{}", e),
            Err(e) => log::debug!("渲染进程 stdin 写入任务异常：{}", e),
            Ok(Ok(())) => {}
        }

        if !output.status.success() {
            return Err(CardError::Render(format!(
                "wkhtmltopdf 退出码 {:?}：{}",
                output.status.code(),
                stderr_preview(&output.stderr)
            )));
        }

        if output.stdout.is_empty() {
            return Err(CardError::Render("wkhtmltopdf 未输出任何内容".to_string()));
        }

        log::debug!("📄 HTML 渲染完成 - {} 字节", output.stdout.len());
        Ok(PageBytes::new(output.stdout))
    }
}

/// 基于 `pdftoppm` 的页面栅格化器，PDF 从 stdin 输入，PNG 从 stdout 读取。
#[derive(Debug, Clone)]
pub struct PdftoppmDecoder {
    config: RendererConfig,
}

impl PdftoppmDecoder {
    pub fn new(config: RendererConfig) -> Self {
        Self { config }
    }

    fn args(&self, page_index: usize) -> Vec<String> {
        // pdftoppm 页码从 1 开始
        let page = (page_index + 1).to_string();
        vec![
            "-png".to_string(),
            "-r".to_string(),
            self.config.dpi.to_string(),
            "-f".to_string(),
            page.clone(),
            "-l".to_string(),
            page,
            "-singlefile".to_string(),
            "-".to_string(),
        ]
    }
}

#[async_trait]
impl PageDecoder for PdftoppmDecoder {
    async fn decode_page(&self, page: &PageBytes, page_index: usize) -> Result<Bitmap, CardError> {
        if page.is_empty() {
            return Err(CardError::PageDecode("页面文档为空".to_string()));
        }

        let mut child = Command::new(&self.config.pdftoppm_bin)
            .args(self.args(page_index))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                CardError::PageDecode(format!("无法启动 {}：{}", self.config.pdftoppm_bin, e))
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| CardError::PageDecode("无法获取栅格化进程 stdin".to_string()))?;

        let document = page.0.clone();
        let writer = tokio::spawn(async move {
            stdin.write_all(&document).await?;
            stdin.shutdown().await
        });

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| CardError::PageDecode(format!("等待栅格化进程失败：{}", e)))?;

        if let Ok(Err(e)) = writer.await {
            log::debug!("栅格化进程 stdin 写入中断：{}", e);
        }

        if !output.status.success() {
            return Err(CardError::PageDecode(format!(
                "pdftoppm 退出码 {:?}：{}",
                output.status.code(),
                stderr_preview(&output.stderr)
            )));
        }

        let bitmap = image::load_from_memory(&output.stdout)
            .map_err(|e| CardError::PageDecode(format!("页面 {} 栅格化结果无法解码：{}", page_index, e)))?
            .to_rgba8();

        log::debug!(
            "🖼️ 页面栅格化完成 - 页码: {} 尺寸: {}x{}",
            page_index,
            bitmap.width(),
            bitmap.height()
        );
        Ok(bitmap)
    }
}

fn stderr_preview(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let trimmed = text.trim();
    match trimmed.char_indices().nth(STDERR_PREVIEW_LIMIT) {
        Some((cut, _)) => format!("{}…", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}
