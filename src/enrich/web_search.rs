//! Natural-language web-search provider used by the hospital and airport
//! matchers when offline data is missing or a web-search mode is selected.
//!
//! The provider only returns model text; turning that text into record fields
//! (`hospital_answer`, `airport_answer`) is pure and tested without network.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::WebSearchConfig;
use crate::error::EnrichmentError;
use crate::models::{AirportInfo, EnrichmentMethod, GeoPoint, HospitalInfo};

const SYSTEM_PREFIX: &str =
    "System: Follow instructions exactly. Do not fabricate sources. Return ONLY JSON.\n\n";

/// Longest raw model text kept as reasoning when no JSON could be parsed
const MAX_RAW_REASONING: usize = 5000;

#[async_trait]
pub trait WebSearch: Send + Sync {
    /// Ask one question, returning the model's raw answer text
    async fn ask(&self, prompt: &str) -> Result<String, EnrichmentError>;
}

#[derive(Debug, Deserialize)]
struct ResponsesBody {
    output_text: Option<String>,
    #[serde(default)]
    output: Vec<OutputItem>,
}

#[derive(Debug, Deserialize)]
struct OutputItem {
    #[serde(default)]
    content: Vec<OutputContent>,
}

#[derive(Debug, Deserialize)]
struct OutputContent {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

impl ResponsesBody {
    fn into_text(self) -> Option<String> {
        if let Some(text) = self.output_text.filter(|t| !t.trim().is_empty()) {
            return Some(text);
        }
        let parts: Vec<String> = self
            .output
            .into_iter()
            .flat_map(|item| item.content)
            .filter(|c| c.kind == "output_text")
            .filter_map(|c| c.text)
            .collect();
        (!parts.is_empty()).then(|| parts.join("\n"))
    }
}

/// OpenAI Responses API with the `web_search` tool enabled
pub struct OpenAiWebSearch {
    client: Client,
    endpoint: String,
    model: String,
    api_key: String,
    timeout: Duration,
}

impl OpenAiWebSearch {
    pub fn new(
        client: Client,
        config: &WebSearchConfig,
        api_key: Option<&str>,
    ) -> Result<Self, EnrichmentError> {
        let api_key = api_key
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or(EnrichmentError::MissingCredential("OPENAI_API_KEY"))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            api_key: api_key.to_string(),
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }
}

#[async_trait]
impl WebSearch for OpenAiWebSearch {
    async fn ask(&self, prompt: &str) -> Result<String, EnrichmentError> {
        let body = json!({
            "model": self.model,
            "input": format!("{}{}", SYSTEM_PREFIX, prompt),
            "tools": [{"type": "web_search"}],
        });

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EnrichmentError::Timeout
                } else {
                    EnrichmentError::Http(e)
                }
            })?;
        if !response.status().is_success() {
            return Err(EnrichmentError::from_status(response.status()));
        }

        let parsed: ResponsesBody = response.json().await?;
        parsed
            .into_text()
            .ok_or_else(|| EnrichmentError::Parse("web search returned no output".to_string()))
    }
}

static FENCED_JSON: OnceLock<Option<Regex>> = OnceLock::new();
static BARE_JSON: OnceLock<Option<Regex>> = OnceLock::new();

fn compiled(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

/// First JSON object in model text: a ```json fence wins, then the widest `{...}`
pub fn extract_first_json(text: &str) -> Option<Value> {
    let fenced = compiled(&FENCED_JSON, r"```json\s*(\{[\s\S]*?\})\s*```");
    if let Some(caps) = fenced.and_then(|re| re.captures(text)) {
        if let Ok(v @ Value::Object(_)) = serde_json::from_str(&caps[1]) {
            return Some(v);
        }
    }
    let m = compiled(&BARE_JSON, r"\{[\s\S]*\}")?.find(text)?;
    match serde_json::from_str(m.as_str()) {
        Ok(v @ Value::Object(_)) => Some(v),
        _ => None,
    }
}

fn first_field<'a>(payload: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| payload.get(*k))
        .find(|v| !v.is_null())
}

fn as_text(v: &Value) -> Option<String> {
    let s = match v {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!s.is_empty()).then_some(s)
}

fn as_number(v: &Value) -> Option<f64> {
    let n: Option<f64> = match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    n.filter(|f| f.is_finite())
}

/// Rounded and clamped to 0..=100
fn confidence(payload: &Value, keys: &[&str]) -> Option<u8> {
    first_field(payload, keys)
        .and_then(as_number)
        .map(|c| c.round().clamp(0.0, 100.0) as u8)
}

/// Reasoning with up to `max_links` sources appended
fn reasoning_with_links(payload: &Value, max_links: usize) -> Option<String> {
    let reasoning = payload.get("reasoning").and_then(as_text).unwrap_or_default();
    let links: Vec<String> = first_field(payload, &["sources", "urls", "links"])
        .and_then(Value::as_array)
        .map(|urls| urls.iter().filter_map(as_text).take(max_links).collect())
        .unwrap_or_default();

    let combined = match (reasoning.is_empty(), links.is_empty()) {
        (true, true) => return None,
        (false, true) => reasoning,
        (true, false) => format!("Sources: {}", links.join(", ")),
        (false, false) => format!("{} | Sources: {}", reasoning, links.join(", ")),
    };
    Some(combined)
}

fn truncated(text: &str) -> String {
    text.chars().take(MAX_RAW_REASONING).collect()
}

fn parse_yes_no(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "yes" | "true" => Some(true),
            "no" | "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

pub fn hospital_prompt(city: &str, country: &str) -> String {
    format!(
        "You are a careful research assistant. Use the web_search tool and rely only on reputable \
         sources (hospital or health-system sites, public health portals, national healthcare \
         directories, or Wikipedia where it cites official sources).\n\n\
         Question: Is there at least one hospital located within the city limits of {city}, {country}?\n\
         - If sources conflict or are unclear, answer \"no\" with a lower confidence.\n\
         - Give 1-2 sentences of reasoning and 1-3 relevant URLs.\n\n\
         Return JSON only, with exactly these fields:\n\
         {{\n  \"hospital_in_city\": \"yes\" | \"no\",\n  \"confidence_pct\": number (0-100),\n  \
         \"reasoning\": string,\n  \"sources\": [string URL, ...]\n}}"
    )
}

pub fn airport_prompt(city: &str, country: &str, location: Option<GeoPoint>) -> String {
    let hint = location
        .map(|p| format!(" (coordinates: {:.5}, {:.5})", p.lat, p.lon))
        .unwrap_or_default();
    format!(
        "You are a careful research assistant. Use the web_search tool and rely only on reputable \
         sources (airport websites, IATA/ICAO directories, civil aviation authorities, or \
         Wikipedia where it cites official sources).\n\n\
         Task: Identify the nearest international airport to {city}, {country}{hint}.\n\
         An international airport has scheduled international passenger service.\n\
         Return JSON only, with exactly these fields:\n\
         {{\n  \"airport_name\": string,\n  \"airport_iata\": string | null,\n  \
         \"airport_icao\": string | null,\n  \"airport_latitude\": number | null,\n  \
         \"airport_longitude\": number | null,\n  \"confidence_pct\": number (0-100),\n  \
         \"reasoning\": string (1-3 sentences),\n  \"sources\": [string URL, ...]\n}}"
    )
}

/// Turn raw model text into hospital fields; unparseable text becomes an error
pub fn hospital_answer(text: &str, max_links: usize) -> HospitalInfo {
    let Some(payload) = extract_first_json(text) else {
        return HospitalInfo {
            reasoning: Some(truncated(text)),
            method: Some(EnrichmentMethod::WebSearch),
            error: Some("failed to parse JSON from model output".to_string()),
            ..HospitalInfo::default()
        };
    };

    let in_city = first_field(&payload, &["hospital_in_city", "in_city", "answer"])
        .and_then(parse_yes_no);
    HospitalInfo {
        in_city,
        in_city_or_nearby: in_city.filter(|yes| *yes),
        confidence_pct: confidence(&payload, &["confidence_pct", "hospital_confidence_pct"]),
        reasoning: reasoning_with_links(&payload, max_links),
        method: Some(EnrichmentMethod::WebSearch),
        error: in_city
            .is_none()
            .then(|| "model answer missing hospital_in_city".to_string()),
        ..HospitalInfo::default()
    }
}

/// Turn raw model text into airport fields; crow-flies distance is derived
/// from `origin` when the answer carries coordinates
pub fn airport_answer(text: &str, origin: GeoPoint, max_links: usize) -> AirportInfo {
    let Some(payload) = extract_first_json(text) else {
        return AirportInfo {
            reasoning: Some(truncated(text)),
            ..AirportInfo::failed(
                "failed to parse JSON from model output",
                EnrichmentMethod::WebSearch,
            )
        };
    };

    let text_field = |keys: &[&str]| first_field(&payload, keys).and_then(as_text);
    let name = text_field(&["airport_name", "name"]);
    let iata = text_field(&["airport_iata", "iata"]).map(|c| c.to_uppercase());
    let icao = text_field(&["airport_icao", "icao"]).map(|c| c.to_uppercase());
    let lat = first_field(&payload, &["airport_latitude", "lat", "latitude"]).and_then(as_number);
    let lon = first_field(&payload, &["airport_longitude", "lon", "lng", "longitude"])
        .and_then(as_number);
    let location = match (lat, lon) {
        (Some(lat), Some(lon))
            if (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon) =>
        {
            Some(GeoPoint::new(lat, lon))
        }
        _ => None,
    };

    let identified = name.is_some() || iata.is_some() || icao.is_some();
    AirportInfo {
        nearest_name: name.or_else(|| iata.clone()).or_else(|| icao.clone()),
        nearest_iata: iata,
        nearest_icao: icao,
        nearest_location: location,
        crow_km: location.map(|p| origin.distance_km(&p)),
        driving_km: None,
        driving_minutes: None,
        confidence_pct: confidence(&payload, &["confidence_pct"]),
        reasoning: reasoning_with_links(&payload, max_links),
        method: Some(EnrichmentMethod::WebSearch),
        error: (!identified).then(|| "model answer names no airport".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_prefers_fenced_block() {
        let text = "Here you go {\"ignored\": 1}\n```json\n{\"hospital_in_city\": \"yes\"}\n```";
        let v = extract_first_json(text).unwrap();
        assert_eq!(v["hospital_in_city"], "yes");
    }

    #[test]
    fn test_extract_bare_object_and_garbage() {
        let v = extract_first_json("Answer: {\"a\": {\"b\": 2}} trailing").unwrap();
        assert_eq!(v["a"]["b"], 2);
        assert!(extract_first_json("no json here").is_none());
        assert!(extract_first_json("{not json}").is_none());
    }

    #[test]
    fn test_hospital_answer_coercion() {
        let text = r#"{"hospital_in_city": "Yes", "confidence_pct": 104.6,
            "reasoning": "Regional hospital in the centre.",
            "sources": ["https://a.example", "https://b.example", "https://c.example", "https://d.example"]}"#;
        let info = hospital_answer(text, 3);
        assert_eq!(info.in_city, Some(true));
        assert_eq!(info.in_city_or_nearby, Some(true));
        assert_eq!(info.confidence_pct, Some(100));
        assert_eq!(
            info.reasoning.as_deref(),
            Some("Regional hospital in the centre. | Sources: https://a.example, https://b.example, https://c.example")
        );
        assert_eq!(info.method, Some(EnrichmentMethod::WebSearch));
        assert!(info.error.is_none());
    }

    #[test]
    fn test_hospital_answer_no_leaves_nearby_unknown() {
        let info = hospital_answer(r#"{"hospital_in_city": "no", "confidence_pct": "40"}"#, 3);
        assert_eq!(info.in_city, Some(false));
        assert_eq!(info.in_city_or_nearby, None);
        assert_eq!(info.confidence_pct, Some(40));
    }

    #[test]
    fn test_unparseable_text_is_error() {
        let info = hospital_answer("I could not find anything.", 3);
        assert_eq!(info.in_city, None);
        assert!(info.error.is_some());
        assert_eq!(info.reasoning.as_deref(), Some("I could not find anything."));
        assert!(!info.is_complete());
    }

    #[test]
    fn test_airport_answer_aliases() {
        let text = r#"```json
        {"name": "Geneva Airport", "iata": "gva", "icao": "LSGG", "lat": 46.2381, "lng": 6.1090,
         "confidence_pct": 85, "reasoning": "Closest international field.", "sources": []}
        ```"#;
        let annecy = GeoPoint::new(45.8992, 6.1294);
        let info = airport_answer(text, annecy, 5);
        assert_eq!(info.nearest_name.as_deref(), Some("Geneva Airport"));
        assert_eq!(info.nearest_iata.as_deref(), Some("GVA"));
        let crow = info.crow_km.unwrap();
        assert!(crow > 35.0 && crow < 40.0, "{}", crow);
        assert!(info.driving_minutes.is_none());
        assert!(info.is_complete());
    }

    #[test]
    fn test_airport_answer_without_airport_is_error() {
        let info = airport_answer(
            r#"{"airport_name": null, "confidence_pct": 10}"#,
            GeoPoint::new(46.0, 7.0),
            5,
        );
        assert!(info.nearest_name.is_none());
        assert!(info.error.is_some());
        assert!(!info.is_complete());
    }

    #[test]
    fn test_responses_body_output_text_fallback() {
        let body: ResponsesBody = serde_json::from_value(json!({
            "output": [
                {"type": "web_search_call"},
                {"type": "message", "content": [{"type": "output_text", "text": "{\"x\":1}"}]}
            ]
        }))
        .unwrap();
        assert_eq!(body.into_text().as_deref(), Some("{\"x\":1}"));
    }

    #[test]
    fn test_prompts_name_the_city() {
        assert!(hospital_prompt("Chamonix", "FR").contains("city limits of Chamonix, FR"));
        let p = airport_prompt("Chamonix", "FR", Some(GeoPoint::new(45.92, 6.87)));
        assert!(p.contains("(coordinates: 45.92000, 6.87000)"));
        assert!(p.contains("\"airport_iata\""));
    }
}
