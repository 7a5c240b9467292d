// Device wire protocol - line-delimited JSON commands and replies
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::IpAddr;
use std::time::Duration;

use crate::types::Rgb;

pub const DEFAULT_PORT: u16 = 55443;

// Devices reject "smooth" ramps shorter than this
const MIN_SMOOTH_MS: u64 = 30;

/// How the device ramps to a new power/brightness/color value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    Sudden,
    Smooth(Duration),
}

impl Effect {
    pub fn from_transition(transition: Duration) -> Self {
        if transition.as_millis() >= u128::from(MIN_SMOOTH_MS) {
            Effect::Smooth(transition)
        } else {
            Effect::Sudden
        }
    }

    fn params(self) -> [Value; 2] {
        match self {
            Effect::Sudden => [json!("sudden"), json!(0)],
            Effect::Smooth(d) => [json!("smooth"), json!(d.as_millis() as u64)],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    PowerOn(Effect),
    SetBrightness(u8, Effect),
    SetRgb(Rgb, Effect),
    GetBrightness,
    StartMusic { host: IpAddr, port: u16 },
    StopMusic,
}

impl Command {
    pub fn method(&self) -> &'static str {
        match self {
            Command::PowerOn(_) => "set_power",
            Command::SetBrightness(..) => "set_bright",
            Command::SetRgb(..) => "set_rgb",
            Command::GetBrightness => "get_prop",
            Command::StartMusic { .. } | Command::StopMusic => "set_music",
        }
    }

    fn params(&self) -> Vec<Value> {
        match self {
            Command::PowerOn(effect) => {
                let [kind, ms] = effect.params();
                vec![json!("on"), kind, ms]
            }
            Command::SetBrightness(percent, effect) => {
                let [kind, ms] = effect.params();
                vec![json!(percent), kind, ms]
            }
            Command::SetRgb(color, effect) => {
                let [kind, ms] = effect.params();
                vec![json!(color.packed()), kind, ms]
            }
            Command::GetBrightness => vec![json!("bright")],
            Command::StartMusic { host, port } => vec![json!(1), json!(host.to_string()), json!(port)],
            Command::StopMusic => vec![json!(0)],
        }
    }
}

#[derive(Serialize)]
struct Request<'a> {
    id: u32,
    method: &'a str,
    params: Vec<Value>,
}

/// Serialize a command as one `\r\n` terminated line.
pub fn encode(id: u32, command: &Command) -> serde_json::Result<String> {
    let request = Request {
        id,
        method: command.method(),
        params: command.params(),
    };
    let mut line = serde_json::to_string(&request)?;
    line.push_str("\r\n");
    Ok(line)
}

#[derive(Debug, Deserialize)]
pub struct ReplyError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

/// One line received from the device. Notifications carry no id.
#[derive(Debug, Deserialize)]
pub struct Reply {
    pub id: Option<u32>,
    pub result: Option<Vec<Value>>,
    pub error: Option<ReplyError>,
}

impl Reply {
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }

    pub fn into_result(self) -> Result<Vec<Value>, String> {
        match (self.result, self.error) {
            (_, Some(err)) => Err(format!("device error {}: {}", err.code, err.message)),
            (Some(result), None) => Ok(result),
            (None, None) => Err("reply carries neither result nor error".to_string()),
        }
    }
}

/// Brightness from a `get_prop ["bright"]` result; devices report it as a string.
pub fn parse_brightness(result: &[Value]) -> Option<u8> {
    match result.first()? {
        Value::String(s) => s.trim().parse().ok(),
        Value::Number(n) => n.as_u64().and_then(|v| u8::try_from(v).ok()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn decode(line: &str) -> Value {
        assert!(line.ends_with("\r\n"));
        assert_eq!(line.matches("\r\n").count(), 1);
        serde_json::from_str(line.trim_end()).unwrap()
    }

    #[test]
    fn power_on_carries_transition() {
        let line = encode(1, &Command::PowerOn(Effect::from_transition(Duration::from_millis(200)))).unwrap();
        assert_eq!(
            decode(&line),
            json!({"id": 1, "method": "set_power", "params": ["on", "smooth", 200]})
        );
    }

    #[test]
    fn short_transition_is_sudden() {
        assert_eq!(Effect::from_transition(Duration::from_millis(10)), Effect::Sudden);
        let line = encode(2, &Command::SetBrightness(40, Effect::Sudden)).unwrap();
        assert_eq!(
            decode(&line),
            json!({"id": 2, "method": "set_bright", "params": [40, "sudden", 0]})
        );
    }

    #[test]
    fn rgb_is_packed() {
        let line = encode(7, &Command::SetRgb(Rgb::new(1, 2, 3), Effect::Sudden)).unwrap();
        assert_eq!(decode(&line)["params"][0], json!(65536 + 2 * 256 + 3));
    }

    #[test]
    fn music_mode_commands() {
        let start = Command::StartMusic {
            host: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)),
            port: 40123,
        };
        assert_eq!(decode(&encode(3, &start).unwrap())["params"], json!([1, "192.168.1.20", 40123]));
        assert_eq!(decode(&encode(4, &Command::StopMusic).unwrap())["params"], json!([0]));
    }

    #[test]
    fn replies_and_notifications() {
        let ok = Reply::parse(r#"{"id":3,"result":["ok"]}"#).unwrap();
        assert_eq!(ok.id, Some(3));
        assert_eq!(ok.into_result().unwrap(), vec![json!("ok")]);

        let err = Reply::parse(r#"{"id":4,"error":{"code":-1,"message":"unsupported method"}}"#).unwrap();
        assert!(err.into_result().unwrap_err().contains("unsupported method"));

        let note = Reply::parse(r#"{"method":"props","params":{"bright":"50"}}"#).unwrap();
        assert_eq!(note.id, None);
    }

    #[test]
    fn brightness_property() {
        assert_eq!(parse_brightness(&[json!("45")]), Some(45));
        assert_eq!(parse_brightness(&[json!(80)]), Some(80));
        assert_eq!(parse_brightness(&[json!("")]), None);
        assert_eq!(parse_brightness(&[]), None);
    }
}
