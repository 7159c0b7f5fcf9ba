//! # 加载与校验模块（SourceLoader）
//!
//! ## 设计思路
//!
//! 统一处理直接可栅格化的卡片来源（URL / Base64），并在“尽可能早”的阶段执行输入校验。
//! 目标是尽快失败，减少不必要内存与 CPU 消耗。HTML 卡片不经过这里，由渲染批处理负责。
//!
//! ## 实现思路
//!
//! - URL：协议 + 主机安全 + 手动逐跳重定向校验 + 内容类型 + 体积校验 + 流式下载。
//! - DNS 校验通过后，本跳请求固定连接到已校验的地址，避免二次解析被改写（DNS rebinding）。
//! - Base64：Data URL 前缀剥离 + 去除空白（兼容 MIME 76 列换行）+ 解码前体积估算 + 解码。
//! - 字节加载后先用文件签名（magic bytes）拒绝非图片，再交给 `pipeline` 解码。
//! - 不做重试：单次失败即终止该卡片，由采集器记录并丢弃。

use base64::{Engine as _, engine::general_purpose};
use std::borrow::Cow;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::lookup_host;

use super::card::{Bitmap, Card, CardKind, RawImageData};
use super::pipeline::decode_raster;
use super::{CardError, CompositeConfig, CompositeError};

const BUFFER_INITIAL_CAPACITY: usize = 16 * 1024;

/// 卡片图片加载器。
///
/// 持有复用型 HTTP 客户端与配置快照，可在多个 worker 间通过 `Arc` 共享。
pub struct SourceLoader {
    client: reqwest::Client,
    config: Arc<CompositeConfig>,
}

impl SourceLoader {
    pub fn new(config: CompositeConfig) -> Result<Self, CompositeError> {
        let client = build_http_client(&config)?;
        Ok(Self::with_client(client, config))
    }

    /// 复用外部构建的 HTTP 客户端（同一 handler 内多次请求共享连接池）。
    pub fn with_client(client: reqwest::Client, config: CompositeConfig) -> Self {
        Self {
            client,
            config: Arc::new(config),
        }
    }

    /// 将一张直接类型卡片解析为位图。
    pub async fn load(&self, card: &Card) -> Result<Bitmap, CardError> {
        let raw = match card.kind {
            CardKind::Url => self.load_from_url(&card.source).await?,
            CardKind::Base64 => self.load_from_base64(&card.source)?,
            CardKind::Html => {
                return Err(CardError::Unsupported(format!(
                    "HTML 卡片 {} 需经渲染批处理，不能直接加载",
                    card.id
                )));
            }
        };

        let config = Arc::clone(&self.config);
        tokio::task::spawn_blocking(move || decode_raster(raw, &config))
            .await
            .map_err(|e| CardError::Decode(format!("解码任务异常退出：{}", e)))?
    }

    /// 从 URL 加载图片原始字节。
    pub(crate) async fn load_from_url(&self, url: &str) -> Result<RawImageData, CardError> {
        log::info!("🌐 开始下载卡片图片 - URL: {}", redact_url_for_log(url));

        let bytes = self.fetch_url(url).await?;
        validate_image_signature(&bytes)?;

        Ok(RawImageData {
            bytes,
            source_hint: "url",
        })
    }

    /// 从 Base64 字符串加载图片原始字节。
    pub(crate) fn load_from_base64(&self, data: &str) -> Result<RawImageData, CardError> {
        log::debug!("📝 开始处理 base64 卡片图片");

        let bytes = self.decode_base64(data)?;
        validate_image_signature(&bytes)?;

        Ok(RawImageData {
            bytes,
            source_hint: "base64",
        })
    }

    /// 解码 Base64 输入（支持 Data URL / 纯 Base64），解码前按体积上限快速拒绝。
    pub fn decode_base64(&self, data: &str) -> Result<Vec<u8>, CardError> {
        parse_base64_with_limit(data, self.config.max_file_size)
    }

    /// 执行带校验的网络下载。
    ///
    /// 自动重定向关闭，每一跳都重新做主机安全校验。使用流式读取，边读边校验体积。
    pub async fn fetch_url(&self, url: &str) -> Result<Vec<u8>, CardError> {
        let config = &self.config;
        let mut pinned = validate_url_safety(url, config).await?;

        let mut current_url = reqwest::Url::parse(url)
            .map_err(|e| CardError::Fetch(format!("URL 格式错误：{}", e)))?;

        for redirect_count in 0..=config.max_redirects {
            let client = self.request_client(pinned.as_ref())?;
            let response = client
                .get(current_url.clone())
                .header(reqwest::header::ACCEPT, "image/avif,image/webp,image/png,image/jpeg,image/*,*/*;q=0.8")
                .send()
                .await
                .map_err(|e| map_reqwest_error(e, current_url.as_str(), config))?;

            if response.status().is_redirection() {
                if redirect_count >= config.max_redirects {
                    break;
                }

                let location = response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .ok_or_else(|| CardError::Fetch("重定向响应缺少 Location 头".to_string()))?;

                let location_str = location
                    .to_str()
                    .map_err(|e| CardError::Fetch(format!("重定向地址无效：{}", e)))?;

                let next_url = current_url
                    .join(location_str)
                    .map_err(|e| CardError::Fetch(format!("重定向 URL 解析失败：{}", e)))?;

                pinned = validate_url_safety(next_url.as_str(), config).await?;

                log::debug!("↪️ 跳转到: {}", redact_url_for_log(next_url.as_str()));
                current_url = next_url;
                continue;
            }

            if !response.status().is_success() {
                return Err(CardError::Fetch(format!(
                    "HTTP {}: {}",
                    response.status().as_u16(),
                    status_message(response.status().as_u16())
                )));
            }

            if let Some(ct) = response.headers().get(reqwest::header::CONTENT_TYPE) {
                if let Ok(ct_str) = ct.to_str() {
                    if !is_image_content_type(ct_str) {
                        return Err(CardError::Decode(format!("不是图片类型：{}", ct_str)));
                    }
                }
            }

            let declared_len = response.content_length();
            if let Some(size) = declared_len {
                if size > config.max_file_size {
                    return Err(oversize_error(size, config.max_file_size));
                }
            }

            let initial_capacity = declared_len
                .map(|len| len.min(config.max_file_size) as usize)
                .filter(|len| *len > 0)
                .unwrap_or(BUFFER_INITIAL_CAPACITY);
            let mut buffer = Vec::with_capacity(initial_capacity);
            let mut response = response;

            while let Some(chunk) = response
                .chunk()
                .await
                .map_err(|e| map_reqwest_error(e, current_url.as_str(), config))?
            {
                let total = (buffer.len() + chunk.len()) as u64;
                if total > config.max_file_size {
                    return Err(oversize_error(total, config.max_file_size));
                }
                buffer.extend_from_slice(&chunk);
            }

            log::debug!(
                "📦 下载完成 - URL: {} 大小: {} 字节",
                redact_url_for_log(current_url.as_str()),
                buffer.len()
            );
            return Ok(buffer);
        }

        Err(CardError::Fetch(format!(
            "重定向次数超过限制（{}）",
            config.max_redirects
        )))
    }

    /// 本跳使用的客户端：主机地址已固定时构建绑定客户端，否则复用共享客户端。
    fn request_client(&self, pinned: Option<&PinnedHost>) -> Result<reqwest::Client, CardError> {
        match pinned {
            Some(pinned) => build_pinned_client(&self.config, pinned),
            None => Ok(self.client.clone()),
        }
    }
}

/// 通过 DNS 校验的主机及其公网地址。
#[derive(Debug, Clone, PartialEq, Eq)]
struct PinnedHost {
    host: String,
    addrs: Vec<SocketAddr>,
}

fn build_pinned_client(config: &CompositeConfig, pinned: &PinnedHost) -> Result<reqwest::Client, CardError> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(config.download_timeout))
        .connect_timeout(Duration::from_secs(config.connect_timeout))
        .redirect(reqwest::redirect::Policy::none())
        .resolve_to_addrs(&pinned.host, &pinned.addrs)
        .build()
        .map_err(|e| CardError::Fetch(format!("无法创建 DNS 绑定客户端：{}", e)))
}

/// 构建下载用 HTTP 客户端。
///
/// 自动重定向关闭，由 `fetch_url` 逐跳校验。
pub(crate) fn build_http_client(config: &CompositeConfig) -> Result<reqwest::Client, CompositeError> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(config.download_timeout))
        .connect_timeout(Duration::from_secs(config.connect_timeout))
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| CompositeError::Internal(format!("无法创建 HTTP 客户端：{}", e)))
}

fn oversize_error(size: u64, limit: u64) -> CardError {
    CardError::ResourceLimit(format!(
        "文件过大：{:.2} MB（限制：{:.2} MB）",
        size as f64 / 1024.0 / 1024.0,
        limit as f64 / 1024.0 / 1024.0
    ))
}

fn is_image_content_type(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(|base| {
            let base = base.trim().to_ascii_lowercase();
            base.starts_with("image/") || base == "application/octet-stream"
        })
        .unwrap_or(false)
}

/// 去掉 query 与 fragment，避免签名参数进入日志。
pub(crate) fn redact_url_for_log(url: &str) -> String {
    let Ok(parsed) = reqwest::Url::parse(url) else {
        return "<invalid-url>".to_string();
    };

    let host = parsed.host_str().unwrap_or("<unknown-host>");
    let port = parsed.port().map(|p| format!(":{}", p)).unwrap_or_default();
    let path = parsed.path();

    format!("{}://{}{}{}", parsed.scheme(), host, port, path)
}

/// 校验 URL 安全性。
///
/// 默认阻止本地/内网目标，防止 SSRF 风险。主机名经过 DNS 校验时返回校验过的地址，
/// 调用方必须只连接这些地址。
async fn validate_url_safety(url: &str, config: &CompositeConfig) -> Result<Option<PinnedHost>, CardError> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| CardError::Fetch(format!("URL 格式错误：{}", e)))?;

    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(CardError::Fetch("仅支持 HTTP/HTTPS".to_string()));
    }

    if config.allow_private_network {
        return Ok(None);
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| CardError::Fetch("URL 缺少主机地址".to_string()))?;

    if is_local_hostname(host) {
        return Err(CardError::Fetch(format!("禁止访问本地网络地址：{}", host)));
    }

    let bare_host = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare_host.parse::<IpAddr>() {
        if is_private_or_local_ip(ip) {
            return Err(CardError::Fetch(format!("禁止访问内网 IP：{}", ip)));
        }
        return Ok(None);
    }

    if !config.resolve_dns_for_url_safety {
        return Ok(None);
    }

    let port = parsed
        .port_or_known_default()
        .ok_or_else(|| CardError::Fetch("URL 缺少端口信息".to_string()))?;

    let addrs = resolve_public_socket_addrs(host, port).await?;
    if addrs.is_empty() {
        return Err(CardError::Fetch("URL 未解析到有效公网地址".to_string()));
    }

    Ok(Some(PinnedHost {
        host: host.to_string(),
        addrs,
    }))
}

async fn resolve_public_socket_addrs(host: &str, port: u16) -> Result<Vec<SocketAddr>, CardError> {
    let addrs = lookup_host((host, port))
        .await
        .map_err(|e| CardError::Fetch(format!("URL 主机解析失败：{}", e)))?;

    let mut result = Vec::new();
    for addr in addrs {
        if is_private_or_local_ip(addr.ip()) {
            return Err(CardError::Fetch(format!(
                "URL 解析结果命中内网地址：{}",
                addr.ip()
            )));
        }
        result.push(addr);
    }

    Ok(result)
}

fn is_local_hostname(host: &str) -> bool {
    host.eq_ignore_ascii_case("localhost")
        || host.eq_ignore_ascii_case("localhost.")
        || host.ends_with(".local")
        || host.ends_with(".localhost")
}

/// 判断 IP 是否属于本地/内网/链路本地等受限范围。
fn is_private_or_local_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            if v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_documentation()
                || v4.is_unspecified()
                || v4.is_multicast()
            {
                return true;
            }

            let octets = v4.octets();
            // 0.0.0.0/8 与 CGNAT 100.64.0.0/10
            octets[0] == 0 || (octets[0] == 100 && (octets[1] & 0b1100_0000) == 0b0100_0000)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
        }
    }
}

fn estimate_base64_decoded_upper_bound_len(base64_data: &str) -> Result<u64, CardError> {
    let len = base64_data.trim().len() as u64;
    let groups = len
        .checked_add(3)
        .ok_or_else(|| CardError::ResourceLimit("Base64 输入长度溢出".to_string()))?
        / 4;

    groups
        .checked_mul(3)
        .ok_or_else(|| CardError::ResourceLimit("Base64 解码体积估算溢出".to_string()))
}

fn parse_base64_with_limit(data: &str, max_file_size: u64) -> Result<Vec<u8>, CardError> {
    let normalized = data.trim();

    let payload = if normalized.starts_with("data:") {
        let base64_start = normalized
            .find(";base64,")
            .ok_or_else(|| CardError::Encoding("Data URL 缺少 base64 标记".to_string()))?;
        &normalized[base64_start + ";base64,".len()..]
    } else {
        normalized
    };

    // MIME 风格的 Base64 每 76 列换行（\r\n）
    let payload: Cow<'_, str> = if payload.bytes().any(|b| b.is_ascii_whitespace()) {
        Cow::Owned(payload.chars().filter(|c| !c.is_ascii_whitespace()).collect())
    } else {
        Cow::Borrowed(payload)
    };

    let estimated_len = estimate_base64_decoded_upper_bound_len(&payload)?;
    if estimated_len > max_file_size {
        return Err(CardError::ResourceLimit(format!(
            "Base64 预计解码体积过大：{:.2} MB（限制：{:.2} MB）",
            estimated_len as f64 / 1024.0 / 1024.0,
            max_file_size as f64 / 1024.0 / 1024.0
        )));
    }

    general_purpose::STANDARD
        .decode(payload.as_bytes())
        .map_err(|e| CardError::Encoding(format!("Base64 解码失败：{}", e)))
}

/// 统一映射 reqwest 错误到业务错误。
fn map_reqwest_error(e: reqwest::Error, url: &str, config: &CompositeConfig) -> CardError {
    let redacted = redact_url_for_log(url);
    let err_msg = e.to_string().replace(url, &redacted);

    if e.is_timeout() {
        CardError::Fetch(format!("下载超时（{}秒）：{}", config.download_timeout, err_msg))
    } else if e.is_connect() {
        CardError::Fetch(format!("无法连接：{}", err_msg))
    } else {
        CardError::Fetch(format!("请求失败：{}", err_msg))
    }
}

fn status_message(code: u16) -> &'static str {
    match code {
        404 => "未找到",
        403 => "访问被拒绝",
        500..=599 => "服务器错误",
        _ => "请求失败",
    }
}

/// 通过文件签名（magic bytes）校验输入是否为图片。
fn validate_image_signature(bytes: &[u8]) -> Result<(), CardError> {
    if bytes.is_empty() {
        return Err(CardError::Decode("图片内容为空".to_string()));
    }

    let kind = infer::get(bytes).ok_or_else(|| CardError::Decode("无法识别图片类型".to_string()))?;

    if kind.matcher_type() != infer::MatcherType::Image {
        return Err(CardError::Decode(format!(
            "文件签名不是图片类型：{}",
            kind.mime_type()
        )));
    }

    Ok(())
}
