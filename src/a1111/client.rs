//! Client for the Automatic1111 web UI API.

use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::db::models::GenerationSettings;
use crate::utils::http::get_http_client;
use crate::utils::media::detect_mime_type;
use crate::utils::timing::log_backend_timing;

const ERROR_BODY_LIMIT: usize = 800;

#[derive(Debug, thiserror::Error)]
pub enum A1111Error {
    #[error("Timed out after {}s waiting for the image backend", .0.as_secs())]
    Timeout(Duration),
    #[error("Could not reach the image backend: {0}")]
    Transport(String),
    #[error("Image backend returned HTTP {status}: {body}")]
    Api { status: u16, body: String },
    #[error("Image backend returned no image")]
    NoImage,
    #[error("Could not decode the returned image: {0}")]
    Decode(String),
}

#[derive(Debug, Serialize)]
struct Txt2ImgRequest<'a> {
    prompt: &'a str,
    negative_prompt: &'a str,
    steps: i64,
    sampler_name: &'a str,
    cfg_scale: f64,
    width: i64,
    height: i64,
    save_images: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    override_settings: Option<OverrideSettings<'a>>,
}

#[derive(Debug, Serialize)]
struct OverrideSettings<'a> {
    sd_model_checkpoint: &'a str,
}

#[derive(Debug, Deserialize)]
struct Txt2ImgResponse {
    #[serde(default)]
    images: Option<Vec<String>>,
}

/// Checkpoint entry from `/sdapi/v1/sd-models`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SdModel {
    pub title: String,
    pub model_name: String,
}

#[derive(Debug, Clone)]
pub struct A1111Client {
    client: Client,
    base_url: Url,
    timeout: Duration,
}

fn truncate_for_log(value: &str, limit: usize) -> String {
    if value.chars().count() <= limit {
        return value.to_string();
    }
    let truncated: String = value.chars().take(limit).collect();
    format!("{truncated}... (truncated)")
}

fn build_txt2img_request<'a>(
    positive: &'a str,
    negative: &'a str,
    settings: &'a GenerationSettings,
) -> Txt2ImgRequest<'a> {
    Txt2ImgRequest {
        prompt: positive,
        negative_prompt: negative,
        steps: settings.steps,
        sampler_name: &settings.sampler_name,
        cfg_scale: settings.cfg_scale,
        width: settings.width,
        height: settings.height,
        save_images: true,
        override_settings: settings
            .model_name
            .as_deref()
            .filter(|model| !model.trim().is_empty())
            .map(|model| OverrideSettings {
                sd_model_checkpoint: model,
            }),
    }
}

fn decode_first_image(response: Txt2ImgResponse) -> Result<Vec<u8>, A1111Error> {
    let encoded = response
        .images
        .and_then(|images| images.into_iter().next())
        .filter(|image| !image.trim().is_empty())
        .ok_or(A1111Error::NoImage)?;

    // Some builds prefix the payload with a data URL header.
    let payload = match encoded.split_once(";base64,") {
        Some((_, data)) => data,
        None => encoded.as_str(),
    };
    let bytes = general_purpose::STANDARD
        .decode(payload.trim())
        .map_err(|err| A1111Error::Decode(err.to_string()))?;

    match detect_mime_type(&bytes) {
        Some(mime) if mime.starts_with("image/") => Ok(bytes),
        Some(mime) => Err(A1111Error::Decode(format!("unexpected content type {mime}"))),
        None => Err(A1111Error::Decode("unrecognised image format".to_string())),
    }
}

impl A1111Client {
    pub fn new(base_url: Url, timeout: Duration) -> Self {
        Self {
            client: get_http_client().clone(),
            base_url,
            timeout,
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url, A1111Error> {
        self.base_url
            .join(path)
            .map_err(|err| A1111Error::Transport(format!("invalid endpoint {path}: {err}")))
    }

    fn map_send_error(&self, err: reqwest::Error) -> A1111Error {
        warn!(
            "A1111 request failed: {} (timeout={}, connect={}, status={:?})",
            err,
            err.is_timeout(),
            err.is_connect(),
            err.status()
        );
        if err.is_timeout() {
            A1111Error::Timeout(self.timeout)
        } else {
            A1111Error::Transport(err.without_url().to_string())
        }
    }

    // Reading the body can stall or drop just like sending; only a payload
    // that arrived but does not parse is a decode problem.
    fn map_body_error(&self, err: reqwest::Error) -> A1111Error {
        if err.is_decode() && !err.is_timeout() {
            A1111Error::Decode(err.to_string())
        } else {
            self.map_send_error(err)
        }
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, A1111Error> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Err(A1111Error::Api {
            status,
            body: truncate_for_log(&body, ERROR_BODY_LIMIT),
        })
    }

    /// Renders one image and returns its raw bytes.
    pub async fn txt2img(
        &self,
        positive: &str,
        negative: &str,
        settings: &GenerationSettings,
    ) -> Result<Vec<u8>, A1111Error> {
        let url = self.endpoint("sdapi/v1/txt2img")?;
        let request = build_txt2img_request(positive, negative, settings);
        debug!(
            target: "a1111",
            steps = settings.steps,
            sampler = %settings.sampler_name,
            width = settings.width,
            height = settings.height,
            model = ?settings.model_name,
            "Sending txt2img request"
        );

        log_backend_timing("a1111", "txt2img", move || async move {
            let response = self
                .client
                .post(url)
                .timeout(self.timeout)
                .json(&request)
                .send()
                .await
                .map_err(|err| self.map_send_error(err))?;
            let response = Self::check_status(response).await?;
            let body: Txt2ImgResponse = response
                .json()
                .await
                .map_err(|err| self.map_body_error(err))?;
            decode_first_image(body)
        })
        .await
    }

    pub async fn list_models(&self) -> Result<Vec<SdModel>, A1111Error> {
        let url = self.endpoint("sdapi/v1/sd-models")?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| self.map_send_error(err))?;
        let response = Self::check_status(response).await?;
        response
            .json::<Vec<SdModel>>()
            .await
            .map_err(|err| self.map_body_error(err))
    }

    pub async fn health_check(&self) -> bool {
        let Ok(url) = self.endpoint("sdapi/v1/sd-models") else {
            return false;
        };
        match self.client.get(url).send().await {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                debug!("A1111 health check failed: {err}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    // 1x1 transparent PNG.
    const PNG_BASE64: &str = "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAQAAAC1HAwCAAAAC0lEQVR42mNkYAAAAAYAAjCB0C8AAAAASUVORK5CYII=";

    #[test]
    fn payload_carries_settings_and_prompts() {
        let settings = GenerationSettings::default();
        let request = build_txt2img_request("masterpiece, 1boy", "sitting", &settings);
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({
                "prompt": "masterpiece, 1boy",
                "negative_prompt": "sitting",
                "steps": 25,
                "sampler_name": "DPM++ 2M Karras",
                "cfg_scale": 7.0,
                "width": 512,
                "height": 768,
                "save_images": true
            })
        );
    }

    #[test]
    fn payload_overrides_checkpoint_when_model_is_chosen() {
        let settings = GenerationSettings {
            model_name: Some("anything-v5.safetensors".to_string()),
            ..GenerationSettings::default()
        };
        let value = serde_json::to_value(build_txt2img_request("a", "b", &settings)).unwrap();
        assert_eq!(
            value["override_settings"]["sd_model_checkpoint"],
            "anything-v5.safetensors"
        );
    }

    #[test]
    fn decodes_first_png_image() {
        let response = Txt2ImgResponse {
            images: Some(vec![PNG_BASE64.to_string(), "ignored".to_string()]),
        };
        let bytes = decode_first_image(response).unwrap();
        assert_eq!(&bytes[1..4], b"PNG");
    }

    #[test]
    fn accepts_data_url_prefix() {
        let response = Txt2ImgResponse {
            images: Some(vec![format!("data:image/png;base64,{PNG_BASE64}")]),
        };
        assert!(decode_first_image(response).is_ok());
    }

    #[test]
    fn missing_images_and_bad_payloads_are_errors() {
        assert!(matches!(
            decode_first_image(Txt2ImgResponse { images: None }),
            Err(A1111Error::NoImage)
        ));
        assert!(matches!(
            decode_first_image(Txt2ImgResponse {
                images: Some(Vec::new())
            }),
            Err(A1111Error::NoImage)
        ));
        assert!(matches!(
            decode_first_image(Txt2ImgResponse {
                images: Some(vec!["!!not base64!!".to_string()])
            }),
            Err(A1111Error::Decode(_))
        ));
        let text = general_purpose::STANDARD.encode("plain text, not an image");
        assert!(matches!(
            decode_first_image(Txt2ImgResponse {
                images: Some(vec![text])
            }),
            Err(A1111Error::Decode(_))
        ));
    }

    #[test]
    fn response_without_images_key_parses() {
        let parsed: Txt2ImgResponse = serde_json::from_str(r#"{"parameters": {}}"#).unwrap();
        assert!(parsed.images.is_none());
    }

    #[tokio::test]
    async fn stalled_response_body_is_reported_as_timeout() {
        use tokio::io::AsyncWriteExt;
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 64\r\n\r\n{\"images\": [",
                )
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(socket);
        });

        let base_url = Url::parse(&format!("http://{address}/")).unwrap();
        let client = A1111Client {
            client: Client::builder().no_proxy().build().unwrap(),
            base_url,
            timeout: Duration::from_millis(300),
        };
        let err = client
            .txt2img("masterpiece", "", &GenerationSettings::default())
            .await
            .unwrap_err();
        assert!(matches!(err, A1111Error::Timeout(_)), "{err:?}");
        server.abort();
    }

    #[test]
    fn long_error_bodies_are_truncated() {
        let body = "x".repeat(ERROR_BODY_LIMIT + 5);
        let truncated = truncate_for_log(&body, ERROR_BODY_LIMIT);
        assert!(truncated.ends_with("... (truncated)"));
        assert_eq!(truncate_for_log("short", ERROR_BODY_LIMIT), "short");
    }
}
