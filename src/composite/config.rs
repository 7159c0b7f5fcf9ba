//! # 配置模块
//!
//! ## 设计思路
//!
//! 将所有“可调策略”集中到 `CompositeConfig`，保证运行时行为可观测、可调整、可测试。
//! 其中缩放档位（quality / balanced / speed）作为高层语义，映射到底层滤镜。
//!
//! ## 实现思路
//!
//! - `Default` 提供与历史产物尺寸一致的生产配置（槽位 1012x638，300 DPI 标准卡片）。
//! - `from_json_file` 支持从 JSON 文件加载，缺省字段回退默认值。
//! - `validate` 统一做范围校验，避免非法配置进入流水线。

use std::fs;
use std::path::Path;

use image::ImageFormat;
use serde::{Deserialize, Serialize};

use super::CompositeError;

/// 槽位几何参数。
///
/// 默认值对应 300 DPI 下的标准信用卡尺寸，修改后输出尺寸将与历史产物不一致。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlotLayout {
    /// 槽位宽度（约 3.375 英寸）。
    pub slot_width: u32,
    /// 槽位高度（约 2.125 英寸）。
    pub slot_height: u32,
    /// 相邻槽位之间的间距。
    pub inner_margin: u32,
    /// 画布四周留白。
    pub outer_margin: u32,
}

impl Default for SlotLayout {
    fn default() -> Self {
        Self {
            slot_width: 1012,
            slot_height: 638,
            inner_margin: 30,
            outer_margin: 60,
        }
    }
}

/// 缩放档位。
///
/// - `Quality`：Catmull-Rom 卷积，尽量保真
/// - `Balanced`：双线性
/// - `Speed`：最近邻，吞吐优先（默认）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResizeProfile {
    Quality,
    Balanced,
    Speed,
}

impl ResizeProfile {
    /// 从外部字符串解析档位。
    ///
    /// # 示例
    /// ```rust
    /// use card_composite::composite::ResizeProfile;
    ///
    /// let p = ResizeProfile::from_str("balanced")?;
    /// assert_eq!(p.as_str(), "balanced");
    /// # Ok::<(), card_composite::composite::CompositeError>(())
    /// ```
    pub fn from_str(profile: &str) -> Result<Self, CompositeError> {
        match profile.trim().to_lowercase().as_str() {
            "quality" => Ok(Self::Quality),
            "balanced" => Ok(Self::Balanced),
            "speed" => Ok(Self::Speed),
            other => Err(CompositeError::Config(format!(
                "未知缩放档位：{}（可选：quality / balanced / speed）",
                other
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Quality => "quality",
            Self::Balanced => "balanced",
            Self::Speed => "speed",
        }
    }
}

/// 最终产物编码格式。
///
/// `Pdf` 只由 `generate_pdf` 产出，不能作为位图合成的 `output_format`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Png,
    Jpeg,
    Pdf,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpg",
            Self::Pdf => "pdf",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
            Self::Pdf => "application/pdf",
        }
    }

    pub(crate) fn image_format(self) -> Option<ImageFormat> {
        match self {
            Self::Png => Some(ImageFormat::Png),
            Self::Jpeg => Some(ImageFormat::Jpeg),
            Self::Pdf => None,
        }
    }
}

/// 外部渲染引擎参数。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    /// `wkhtmltopdf` 可执行文件路径。
    pub wkhtmltopdf_bin: String,
    /// `pdftoppm` 可执行文件路径。
    pub pdftoppm_bin: String,
    /// 渲染与栅格化 DPI。
    pub dpi: u32,
    /// 页面规格（wkhtmltopdf `--page-size`）。
    pub page_size: String,
    /// 页面四周边距（毫米）。
    pub margin_mm: u32,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            wkhtmltopdf_bin: "wkhtmltopdf".to_string(),
            pdftoppm_bin: "pdftoppm".to_string(),
            dpi: 300,
            page_size: "Letter".to_string(),
            margin_mm: 40,
        }
    }
}

/// 合成流水线配置。
///
/// 字段覆盖了下载、解码、并发、布局与编码五个阶段。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompositeConfig {
    pub layout: SlotLayout,
    /// 直接加载（URL / Base64）worker 数量。
    pub fetch_workers: usize,
    /// HTML 渲染 worker 数量，渲染开销大，应小于 `fetch_workers`。
    pub render_workers: usize,
    /// 单次合成请求的总超时（毫秒）。
    pub request_timeout_ms: u64,
    /// 网络下载超时时间（秒）。
    pub download_timeout: u64,
    /// 建立连接（TCP/TLS）超时时间（秒）。
    pub connect_timeout: u64,
    /// 最大重定向次数。
    pub max_redirects: usize,
    /// 是否允许访问内网或本地地址（默认关闭，防 SSRF）。
    pub allow_private_network: bool,
    /// 是否对域名做 DNS 解析后再校验内网地址。
    pub resolve_dns_for_url_safety: bool,
    /// 下载/Base64 解码后允许的最大体积（字节）。
    pub max_file_size: u64,
    /// 解码后的像素上限（`width * height`）。
    pub max_decoded_pixels: u64,
    /// 解码阶段允许的预计内存上限（按 RGBA 估算，字节）。
    pub max_decoded_bytes: u64,
    pub resize_profile: ResizeProfile,
    pub output_format: OutputFormat,
    pub renderer: RendererConfig,
}

impl Default for CompositeConfig {
    fn default() -> Self {
        Self {
            layout: SlotLayout::default(),
            fetch_workers: 10,
            render_workers: 4,
            request_timeout_ms: 120_000,
            download_timeout: 30,
            connect_timeout: 8,
            max_redirects: 5,
            allow_private_network: false,
            resolve_dns_for_url_safety: true,
            max_file_size: 50 * 1024 * 1024,
            max_decoded_pixels: 40_000_000,
            max_decoded_bytes: 160 * 1024 * 1024,
            resize_profile: ResizeProfile::Speed,
            output_format: OutputFormat::Png,
            renderer: RendererConfig::default(),
        }
    }
}

impl CompositeConfig {
    /// 从 JSON 文件加载配置。
    ///
    /// 文件不存在时返回默认配置；内容非法时返回 `Config` 错误。
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, CompositeError> {
        let path = path.as_ref();
        if !path.exists() {
            log::info!("⚙️ 配置文件不存在，使用默认配置：{}", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .map_err(|e| CompositeError::Config(format!("读取配置文件失败：{}", e)))?;
        Self::from_json_str(&content)
    }

    pub fn from_json_str(content: &str) -> Result<Self, CompositeError> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| CompositeError::Config(format!("解析配置文件失败：{}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// 校验配置取值范围。
    pub fn validate(&self) -> Result<(), CompositeError> {
        let layout = &self.layout;
        if layout.slot_width == 0 || layout.slot_height == 0 {
            return Err(CompositeError::Config("槽位宽高必须大于 0".to_string()));
        }
        if !(1..=64).contains(&self.fetch_workers) {
            return Err(CompositeError::Config("fetch_workers 必须在 1~64 之间".to_string()));
        }
        if !(1..=64).contains(&self.render_workers) {
            return Err(CompositeError::Config("render_workers 必须在 1~64 之间".to_string()));
        }
        if !(1..=600).contains(&self.download_timeout) {
            return Err(CompositeError::Config("download_timeout 必须在 1~600 秒之间".to_string()));
        }
        if !(1..=120).contains(&self.connect_timeout) {
            return Err(CompositeError::Config("connect_timeout 必须在 1~120 秒之间".to_string()));
        }
        if !(100..=3_600_000).contains(&self.request_timeout_ms) {
            return Err(CompositeError::Config(
                "request_timeout_ms 必须在 100~3600000 毫秒之间".to_string(),
            ));
        }
        if self.max_file_size == 0 || self.max_decoded_pixels == 0 || self.max_decoded_bytes == 0 {
            return Err(CompositeError::Config("体积与像素上限必须大于 0".to_string()));
        }
        if self.output_format.image_format().is_none() {
            return Err(CompositeError::Config(format!(
                "output_format 不支持 {}，PDF 请使用 generate_pdf",
                self.output_format.extension()
            )));
        }
        if !(72..=1200).contains(&self.renderer.dpi) {
            return Err(CompositeError::Config("renderer.dpi 必须在 72~1200 之间".to_string()));
        }

        Ok(())
    }

    pub(crate) fn apply_resize_profile(&mut self, profile: ResizeProfile) {
        self.resize_profile = profile;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout_matches_standard_card_geometry() {
        let layout = SlotLayout::default();

        assert_eq!(layout.slot_width, 1012);
        assert_eq!(layout.slot_height, 638);
        assert_eq!(layout.inner_margin, 30);
        assert_eq!(layout.outer_margin, 60);
    }

    #[test]
    fn default_config_is_valid_and_render_pool_is_smaller() {
        let config = CompositeConfig::default();

        config.validate().expect("default config should be valid");
        assert!(config.render_workers < config.fetch_workers);
        assert_eq!(config.resize_profile, ResizeProfile::Speed);
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config = CompositeConfig::from_json_str(
            r#"{"fetch_workers": 3, "layout": {"outer_margin": 10}, "output_format": "jpeg"}"#,
        )
        .expect("partial config should parse");

        assert_eq!(config.fetch_workers, 3);
        assert_eq!(config.render_workers, 4);
        assert_eq!(config.layout.outer_margin, 10);
        assert_eq!(config.layout.slot_width, 1012);
        assert_eq!(config.output_format, OutputFormat::Jpeg);
    }

    #[test]
    fn json_with_zero_workers_is_rejected() {
        let result = CompositeConfig::from_json_str(r#"{"render_workers": 0}"#);
        assert!(matches!(result, Err(CompositeError::Config(_))));
    }

    #[test]
    fn pdf_is_not_a_composite_output_format() {
        let result = CompositeConfig::from_json_str(r#"{"output_format": "pdf"}"#);
        assert!(matches!(result, Err(CompositeError::Config(msg)) if msg.contains("generate_pdf")));
    }

    #[test]
    fn malformed_json_is_rejected() {
        let result = CompositeConfig::from_json_str("{not json");
        assert!(matches!(result, Err(CompositeError::Config(_))));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let path = std::env::temp_dir().join("card-composite-config-does-not-exist.json");
        let config = CompositeConfig::from_json_file(&path).expect("missing file should fall back");
        assert_eq!(config, CompositeConfig::default());
    }

    #[test]
    fn resize_profile_parsing() {
        assert_eq!(ResizeProfile::from_str(" Quality ").ok(), Some(ResizeProfile::Quality));
        assert_eq!(ResizeProfile::Speed.as_str(), "speed");
        assert!(matches!(
            ResizeProfile::from_str("ultra"),
            Err(CompositeError::Config(_))
        ));
    }

    #[test]
    fn output_format_extensions() {
        assert_eq!(OutputFormat::Png.extension(), "png");
        assert_eq!(OutputFormat::Jpeg.extension(), "jpg");
        assert_eq!(OutputFormat::Jpeg.mime_type(), "image/jpeg");
        assert_eq!(OutputFormat::Pdf.extension(), "pdf");
        assert_eq!(OutputFormat::Pdf.mime_type(), "application/pdf");
    }
}
