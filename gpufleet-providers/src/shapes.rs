//! Known response shapes of the marketplace API.
//!
//! The API returns differently-shaped JSON depending on endpoint version and
//! on whether a single or multiple objects were requested. Each shape is an
//! explicit variant with its own extraction function; a body that matches no
//! variant is an error, never a guess.

use anyhow::{anyhow, Result};
use chrono::Utc;
use crate::OfferRefused;
use gpufleet_common::{ConnectionInfo, Instance, InstanceStatus, Offer};
use serde::Deserialize;
use serde_json::{Map, Value};

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum OffersShape {
    Wrapped { offers: Vec<Value> },
    Bare(Vec<Value>),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum InstanceShape {
    Plural { instances: Value },
    Singular { instance: Value },
    Bare {
        id: Value,
        #[serde(flatten)]
        rest: Map<String, Value>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum CreateShape {
    Contract {
        #[serde(default)]
        success: Option<bool>,
        new_contract: Value,
    },
    Id { id: Value },
    Rejected {
        success: bool,
        #[serde(default)]
        msg: Option<String>,
        #[serde(default)]
        error: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum LogsShape {
    Inline { logs: String },
    Deferred { result_url: String },
}

/// What a logs call resolved to.
#[derive(Debug, Clone, PartialEq)]
pub enum LogsLocation {
    Inline(String),
    Deferred(String),
}

pub fn parse_offers(body: &str) -> Result<Vec<Offer>> {
    let shape: OffersShape = serde_json::from_str(body)
        .map_err(|e| anyhow!("unrecognized offers response shape: {}", e))?;
    let raw = match shape {
        OffersShape::Wrapped { offers } => offers,
        OffersShape::Bare(offers) => offers,
    };
    // A single malformed offer should not hide the rest of the market.
    Ok(raw.iter().filter_map(|v| offer_from_value(v).ok()).collect())
}

pub fn offer_from_value(v: &Value) -> Result<Offer> {
    let id = v
        .get("id")
        .or_else(|| v.get("ask_contract_id"))
        .and_then(value_to_id)
        .ok_or_else(|| anyhow!("offer without id"))?;

    let num_gpus = v.get("num_gpus").and_then(value_to_f64).unwrap_or(1.0).max(1.0) as u32;
    // Marketplaces report either per-GPU or total VRAM; prefer per-GPU.
    let vram_mb = v
        .get("gpu_ram")
        .or_else(|| v.get("vram_mb"))
        .and_then(value_to_f64)
        .or_else(|| {
            v.get("gpu_total_ram")
                .and_then(value_to_f64)
                .map(|total| total / num_gpus as f64)
        })
        .unwrap_or(0.0)
        .max(0.0) as u64;

    Ok(Offer {
        id,
        gpu_name: str_field(v, &["gpu_name", "gpu", "model"]).unwrap_or_default(),
        vram_mb,
        num_gpus,
        price_per_hour: parse_price(v),
        reliability: v
            .get("reliability2")
            .or_else(|| v.get("reliability"))
            .and_then(value_to_f64)
            .unwrap_or(0.0),
        inet_up_mbps: v.get("inet_up").and_then(value_to_f64).unwrap_or(0.0),
        inet_down_mbps: v.get("inet_down").and_then(value_to_f64).unwrap_or(0.0),
        host_id: v
            .get("host_id")
            .or_else(|| v.get("machine_id"))
            .and_then(value_to_id)
            .unwrap_or_default(),
        datacenter: v
            .get("datacenter")
            .or_else(|| v.get("hosting_type"))
            .map(truthy)
            .unwrap_or(false),
        verified: v
            .get("verified")
            .or_else(|| v.get("verification"))
            .map(truthy)
            .unwrap_or(false),
    })
}

/// Price per hour from whichever field the marketplace used.
///
/// Accepts numbers, decorated strings ("$0.12", "0.12/hr") and the nested
/// `search.totalHour` form. Anything unparsable is +infinity so it can never
/// win a cheapest-first selection.
pub fn parse_price(v: &Value) -> f64 {
    const FIELDS: [&str; 4] = ["dph_total", "dph", "price_per_hour", "price"];
    for field in FIELDS {
        if let Some(p) = v.get(field).and_then(price_value) {
            return p;
        }
    }
    if let Some(p) = v
        .get("search")
        .and_then(|s| s.get("totalHour"))
        .and_then(price_value)
    {
        return p;
    }
    f64::INFINITY
}

fn price_value(v: &Value) -> Option<f64> {
    let p = match v {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => {
            let cleaned = s
                .trim()
                .trim_start_matches('$')
                .trim_end_matches("/hr")
                .trim_end_matches("/h")
                .trim();
            cleaned.parse::<f64>().ok()?
        }
        Value::Object(_) => v.get("total").or_else(|| v.get("value")).and_then(price_value)?,
        _ => return None,
    };
    (p.is_finite() && p >= 0.0).then_some(p)
}

/// Extract the instance from a status response. `Ok(None)` means the
/// marketplace answered but no longer lists the instance.
pub fn parse_instance(body: &str) -> Result<Option<Instance>> {
    let shape: InstanceShape = serde_json::from_str(body)
        .map_err(|e| anyhow!("unrecognized instance response shape: {}", e))?;
    match shape {
        InstanceShape::Plural { instances } => match instances {
            Value::Null => Ok(None),
            Value::Array(items) => items.first().map(instance_from_value).transpose(),
            Value::Object(_) => instance_from_value(&instances).map(Some),
            other => Err(anyhow!("unexpected `instances` payload: {}", other)),
        },
        InstanceShape::Singular { instance } => match instance {
            Value::Null => Ok(None),
            other => instance_from_value(&other).map(Some),
        },
        InstanceShape::Bare { id, rest } => {
            let mut obj = rest;
            obj.insert("id".to_string(), id);
            instance_from_value(&Value::Object(obj)).map(Some)
        }
    }
}

pub fn instance_from_value(v: &Value) -> Result<Instance> {
    let id = v
        .get("id")
        .and_then(value_to_id)
        .ok_or_else(|| anyhow!("instance without id"))?;
    let raw_status = str_field(v, &["actual_status", "status", "state", "cur_state"]);
    // No status yet means the contract exists but nothing was scheduled.
    let status = raw_status
        .as_deref()
        .and_then(InstanceStatus::parse)
        .unwrap_or(InstanceStatus::Created);

    Ok(Instance {
        id,
        offer_id: v.get("ask_contract_id").and_then(value_to_id),
        status,
        raw_status,
        connection: ConnectionInfo {
            public_ip: str_field(v, &["public_ipaddr", "public_ip"]),
            ssh_host: str_field(v, &["ssh_host"]),
            ssh_port: v
                .get("ssh_port")
                .and_then(value_to_f64)
                .map(|p| p as u16),
        },
        price_per_hour: parse_price(v),
        gpu_name: str_field(v, &["gpu_name"]).unwrap_or_default(),
        num_gpus: v.get("num_gpus").and_then(value_to_f64).unwrap_or(1.0) as u32,
        created_at: Utc::now(),
    })
}

/// A `success:false` answer is an [`OfferRefused`]; anything unparseable is a
/// plain error.
pub fn parse_created_id(offer_id: &str, body: &str) -> Result<String> {
    let shape: CreateShape = serde_json::from_str(body)
        .map_err(|e| anyhow!("unrecognized create response shape: {}", e))?;
    match shape {
        CreateShape::Contract {
            success: Some(false),
            ..
        } => Err(OfferRefused::new(offer_id, body.trim()).into()),
        CreateShape::Contract { new_contract, .. } => {
            value_to_id(&new_contract).ok_or_else(|| anyhow!("create response without contract id"))
        }
        CreateShape::Id { id } => {
            value_to_id(&id).ok_or_else(|| anyhow!("create response with invalid id"))
        }
        CreateShape::Rejected {
            success: false,
            msg,
            error,
        } => {
            let reason = msg.or(error).unwrap_or_else(|| "no reason given".to_string());
            Err(OfferRefused::new(offer_id, reason).into())
        }
        CreateShape::Rejected { .. } => Err(anyhow!("create response without contract id: {}", body)),
    }
}

/// Logs come back inline, behind a short-lived URL, or as raw text.
pub fn parse_logs(body: &str) -> Result<LogsLocation> {
    let trimmed = body.trim_start();
    if !trimmed.starts_with('{') {
        return Ok(LogsLocation::Inline(body.to_string()));
    }
    let shape: LogsShape = serde_json::from_str(body)
        .map_err(|e| anyhow!("unrecognized logs response shape: {}", e))?;
    Ok(match shape {
        LogsShape::Inline { logs } => LogsLocation::Inline(logs),
        LogsShape::Deferred { result_url } => LogsLocation::Deferred(result_url),
    })
}

fn value_to_id(v: &Value) -> Option<String> {
    match v {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}

fn value_to_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn str_field(v: &Value, names: &[&str]) -> Option<String> {
    names
        .iter()
        .filter_map(|n| v.get(*n))
        .find_map(|x| match x {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f > 0.0).unwrap_or(false),
        Value::String(s) => matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "true" | "yes" | "1" | "verified" | "datacenter"
        ),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn price_field_variants() {
        assert_eq!(parse_price(&json!({"dph_total": 0.31})), 0.31);
        assert_eq!(parse_price(&json!({"price": "$0.12"})), 0.12);
        assert_eq!(parse_price(&json!({"price_per_hour": "0.40/hr"})), 0.40);
        assert_eq!(parse_price(&json!({"search": {"totalHour": 1.5}})), 1.5);
        assert_eq!(parse_price(&json!({"price": {"total": "0.2"}})), 0.2);
    }

    #[test]
    fn unparsable_price_is_infinite() {
        assert!(parse_price(&json!({"price": "call us"})).is_infinite());
        assert!(parse_price(&json!({})).is_infinite());
        assert!(parse_price(&json!({"dph": -1.0})).is_infinite());
    }

    #[test]
    fn offers_wrapped_and_bare() {
        let wrapped = r#"{"offers":[{"id":1,"gpu_name":"RTX 4090","gpu_ram":24564,"dph_total":0.4,"host_id":77}]}"#;
        let bare = r#"[{"id":"2","gpu_name":"A100","gpu_total_ram":81920,"num_gpus":2,"price":"$1.10"}]"#;
        let a = parse_offers(wrapped).unwrap();
        assert_eq!(a[0].id, "1");
        assert_eq!(a[0].host_id, "77");
        assert_eq!(a[0].vram_mb, 24564);
        let b = parse_offers(bare).unwrap();
        assert_eq!(b[0].vram_mb, 40960);
        assert_eq!(b[0].price_per_hour, 1.10);
    }

    #[test]
    fn unknown_offer_shape_fails_loudly() {
        assert!(parse_offers(r#"{"bundles": []}"#).is_err());
    }

    #[test]
    fn instance_shapes() {
        let plural = r#"{"instances":{"id":5,"actual_status":"running","public_ipaddr":"1.2.3.4"}}"#;
        let singular = r#"{"instance":{"id":"6","status":"loading"}}"#;
        let bare = r#"{"id":7,"cur_state":"stopped"}"#;
        let gone = r#"{"instances":null}"#;

        let i = parse_instance(plural).unwrap().unwrap();
        assert_eq!(i.status, InstanceStatus::Running);
        assert_eq!(i.connection.public_ip.as_deref(), Some("1.2.3.4"));
        assert_eq!(
            parse_instance(singular).unwrap().unwrap().status,
            InstanceStatus::Starting
        );
        assert_eq!(
            parse_instance(bare).unwrap().unwrap().status,
            InstanceStatus::Stopped
        );
        assert!(parse_instance(gone).unwrap().is_none());
        assert!(parse_instance(r#"{"machines":[]}"#).is_err());
    }

    #[test]
    fn create_shapes() {
        assert_eq!(
            parse_created_id("7", r#"{"success":true,"new_contract":12345}"#).unwrap(),
            "12345"
        );
        assert_eq!(parse_created_id("7", r#"{"id":"abc"}"#).unwrap(), "abc");
        let refused = parse_created_id("7", r#"{"success":false,"msg":"no such ask"}"#).unwrap_err();
        assert_eq!(
            OfferRefused::find(&refused),
            Some(&OfferRefused::new("7", "no such ask"))
        );
        let malformed = parse_created_id("7", r#"{"ok":1}"#).unwrap_err();
        assert!(OfferRefused::find(&malformed).is_none());
        assert!(OfferRefused::find(&parse_created_id("7", r#"{"success":true}"#).unwrap_err()).is_none());
    }

    #[test]
    fn logs_shapes() {
        assert_eq!(
            parse_logs(r#"{"logs":"a\nb"}"#).unwrap(),
            LogsLocation::Inline("a\nb".into())
        );
        assert_eq!(
            parse_logs(r#"{"result_url":"https://x/y.log"}"#).unwrap(),
            LogsLocation::Deferred("https://x/y.log".into())
        );
        assert_eq!(
            parse_logs("plain text\n").unwrap(),
            LogsLocation::Inline("plain text\n".into())
        );
        assert!(parse_logs(r#"{"other":1}"#).is_err());
    }
}
