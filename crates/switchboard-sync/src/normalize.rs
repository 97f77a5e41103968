//! Event normalization.
//!
//! Converts raw, untrusted provider payloads into canonical events. The
//! provider speaks several dialects: live call-progress webhooks, CDR
//! webhooks in the on-premise field layout, and cloud-API CDR records
//! returned by the reconciliation pull. All of them are reduced here, and
//! only here, before anything reaches the state store.
//!
//! Normalization is a pure function of its input: no clocks, no store
//! access. Missing timestamps stay `None` and are filled by the store.

use serde_json::Value;
use thiserror::Error;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use switchboard_types::{
    CallDirection, CallEvent, CallStatus, EventKind, EventOrigin, ExtensionEvent,
    ExtensionStatus, NormalizedEvent,
};

/// An input-validation failure. Malformed payloads are logged and dropped
/// by the caller; they are never retried and never reach the state store.
#[derive(Debug, Error)]
#[error("malformed event: {0}")]
pub struct MalformedEvent(pub String);

/// Normalizes one raw payload into zero or more canonical events.
pub fn normalize(
    origin: EventOrigin,
    payload: &Value,
) -> Result<Vec<NormalizedEvent>, MalformedEvent> {
    if !payload.is_object() {
        return Err(MalformedEvent("payload is not a JSON object".to_string()));
    }

    match origin {
        EventOrigin::PollDiff => normalize_poll_cdr(payload).map(|e| vec![e]),
        EventOrigin::WebhookCdr => normalize_push_cdr(origin, payload).map(|e| vec![e]),
        EventOrigin::WebhookCall => {
            let Some(event_type) = str_field(payload, &["event", "action"]) else {
                return Err(MalformedEvent("missing event discriminator".to_string()));
            };
            match event_type.as_str() {
                "Ringing" | "Ring" => normalize_progress(
                    payload,
                    EventKind::Ringing,
                    CallStatus::Ringing,
                )
                .map(|e| vec![e]),
                "AnswerCall" => {
                    normalize_progress(payload, EventKind::Answered, CallStatus::Answered)
                        .map(|e| vec![e])
                }
                "Hangup" => normalize_progress(payload, EventKind::Hangup, CallStatus::Ended)
                    .map(|e| vec![e]),
                "NewCdr" => normalize_push_cdr(origin, payload).map(|e| vec![e]),
                "ALERT" => normalize_extension_alert(payload).map(|e| vec![e]),
                other => Err(MalformedEvent(format!("unknown event type {other:?}"))),
            }
        }
    }
}

/// Live call-progress push (`Ringing`/`Ring`, `AnswerCall`, `Hangup`).
fn normalize_progress(
    payload: &Value,
    kind: EventKind,
    status: CallStatus,
) -> Result<NormalizedEvent, MalformedEvent> {
    let call_id = str_field(payload, &["callid", "call_id"])
        .ok_or_else(|| MalformedEvent(format!("{} event without call id", kind.as_str())))?;

    let mut event = CallEvent::bare(call_id, kind, status, EventOrigin::WebhookCall);
    event.extension = str_field(payload, &["ext", "extid"]);
    event.caller_number = str_field(payload, &["callerid", "from", "src"]);
    event.callee_number = str_field(payload, &["to", "dst"]);
    event.caller_name = str_field(payload, &["callername"]);
    Ok(NormalizedEvent::Call(event))
}

/// CDR push in the on-premise field layout (`NewCdr` webhook or the
/// dedicated CDR endpoint).
fn normalize_push_cdr(
    origin: EventOrigin,
    payload: &Value,
) -> Result<NormalizedEvent, MalformedEvent> {
    let call_id = str_field(payload, &["callid", "uniqueid", "uid"])
        .ok_or_else(|| MalformedEvent("cdr without call id".to_string()))?;

    let direction = if str_field(payload, &["outbound"]).as_deref() == Some("yes")
        || str_field(payload, &["type"]).as_deref() == Some("Outbound")
    {
        CallDirection::Outbound
    } else if str_field(payload, &["internal"]).as_deref() == Some("yes")
        || str_field(payload, &["type"]).as_deref() == Some("Internal")
    {
        CallDirection::Internal
    } else {
        CallDirection::Inbound
    };

    let disposition = str_field(payload, &["disposition"]).unwrap_or_default();

    let mut event = CallEvent::bare(
        call_id,
        EventKind::Cdr,
        terminal_status_from_disposition(&disposition),
        origin,
    );
    event.direction = Some(direction);
    event.extension = str_field(payload, &["ext", "extid"]);
    event.caller_number = str_field(payload, &["src", "callerid"]);
    event.callee_number = str_field(payload, &["dst", "destination"]);
    event.caller_name = str_field(payload, &["callername", "src_name"]);
    event.callee_name = str_field(payload, &["dst_name"]);
    event.trunk = str_field(payload, &["trunk", "dstchannel"]);
    event.start_time = time_field(payload, &["start", "calldate"]);
    event.answer_time = time_field(payload, &["answer"]);
    event.end_time = time_field(payload, &["end"]);
    event.duration = int_field(payload, &["duration", "billsec"]);
    event.ring_duration = int_field(payload, &["ringtime", "ring_duration"]);
    event.recording = str_field(payload, &["recording", "recordfile"]);
    Ok(NormalizedEvent::Call(event))
}

/// One CDR record from the cloud API, as pulled by the reconciliation loop.
fn normalize_poll_cdr(payload: &Value) -> Result<NormalizedEvent, MalformedEvent> {
    let call_id = str_field(payload, &["uid", "callid", "uniqueid"])
        .ok_or_else(|| MalformedEvent("cdr record without uid".to_string()))?;

    let direction = match str_field(payload, &["call_type"])
        .unwrap_or_default()
        .to_lowercase()
        .as_str()
    {
        "outbound" => CallDirection::Outbound,
        "inbound" => CallDirection::Inbound,
        _ => CallDirection::Internal,
    };

    let disposition = str_field(payload, &["disposition"]).unwrap_or_default();
    let caller_number = str_field(payload, &["call_from_number"]);
    let callee_number = str_field(payload, &["call_to_number"]);

    // The extension is not carried explicitly: for outbound calls it is the
    // originating number, otherwise the answering number.
    let extension = match direction {
        CallDirection::Outbound => caller_number.clone(),
        _ => callee_number.clone(),
    };

    let mut event = CallEvent::bare(
        call_id,
        EventKind::Cdr,
        terminal_status_from_disposition(&disposition),
        EventOrigin::PollDiff,
    );
    event.direction = Some(direction);
    event.extension = extension;
    event.caller_number = caller_number;
    event.callee_number = callee_number;
    event.caller_name = str_field(payload, &["call_from_name"]);
    event.callee_name = str_field(payload, &["call_to_name"]);
    event.trunk = str_field(payload, &["dst_trunk", "src_trunk"]);
    event.start_time = time_field(payload, &["time", "start_time"]);
    event.duration = int_field(payload, &["duration"]);
    event.ring_duration = int_field(payload, &["ring_duration"]);
    event.recording = str_field(payload, &["record_file", "recording"]);
    Ok(NormalizedEvent::Call(event))
}

/// Extension presence change (`ALERT`).
fn normalize_extension_alert(payload: &Value) -> Result<NormalizedEvent, MalformedEvent> {
    let extension = str_field(payload, &["ext", "extid"])
        .ok_or_else(|| MalformedEvent("alert without extension".to_string()))?;
    let status_raw = str_field(payload, &["status"])
        .ok_or_else(|| MalformedEvent("alert without status".to_string()))?
        .to_lowercase();

    let status = match status_raw.as_str() {
        "available" | "idle" => ExtensionStatus::Available,
        "ringing" => ExtensionStatus::Ringing,
        "talking" => ExtensionStatus::OnCall,
        "busy" => ExtensionStatus::Busy,
        "dnd" => ExtensionStatus::Dnd,
        "unavailable" => ExtensionStatus::Offline,
        _ => ExtensionStatus::Available,
    };

    Ok(NormalizedEvent::Extension(ExtensionEvent {
        extension,
        status,
        registered: status_raw != "unavailable",
        origin: EventOrigin::WebhookCall,
    }))
}

/// Maps a CDR disposition onto the terminal status of the finished call.
fn terminal_status_from_disposition(disposition: &str) -> CallStatus {
    match disposition.to_uppercase().as_str() {
        "ANSWERED" => CallStatus::Ended,
        "NO ANSWER" | "VOICEMAIL" => CallStatus::NoAnswer,
        "BUSY" => CallStatus::Busy,
        "FAILED" | "CONGESTION" => CallStatus::Failed,
        _ => CallStatus::Missed,
    }
}

/// Returns the first present, non-empty field among `names`, accepting both
/// string and numeric JSON values (extension numbers arrive as either).
fn str_field(payload: &Value, names: &[&str]) -> Option<String> {
    for name in names {
        match payload.get(name) {
            Some(Value::String(s)) if !s.is_empty() => return Some(s.clone()),
            Some(Value::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}

/// Returns the first parseable integer among `names`; providers send
/// durations as both numbers and numeric strings.
fn int_field(payload: &Value, names: &[&str]) -> Option<i64> {
    for name in names {
        match payload.get(name) {
            Some(Value::Number(n)) => return n.as_i64(),
            Some(Value::String(s)) => {
                if let Ok(v) = s.trim().parse::<i64>() {
                    return Some(v);
                }
            }
            _ => {}
        }
    }
    None
}

fn time_field(payload: &Value, names: &[&str]) -> Option<DateTime<Utc>> {
    str_field(payload, names).and_then(|s| parse_provider_time(&s))
}

/// Parses the provider's assorted timestamp dialects. Naive timestamps are
/// taken as UTC, matching the provider's CDR export behavior.
fn parse_provider_time(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }

    const FORMATS: [&str; 5] = [
        "%d/%m/%Y %I:%M:%S %p",
        "%d/%m/%Y %H:%M:%S",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%Y/%m/%d %H:%M:%S",
    ];
    for format in FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    None
}
