//! Tests for `src/webhook.rs` — signature and envelope shape.

use chrono::Utc;

use straylight::webhook::{sign, WebhookEvent, SIGNATURE_HEADER};

#[test]
fn hmac_matches_known_vector() {
    // RFC 4231 test case 2.
    let signature = sign("Jefe", b"what do ya want for nothing?");
    assert_eq!(
        signature,
        "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
    );
}

#[test]
fn signature_depends_on_secret_and_body() {
    let body = br#"{"event":"state_changed"}"#;
    let a = sign("secret-a", body);
    let b = sign("secret-b", body);
    assert_ne!(a, b, "different secrets must produce different signatures");

    let c = sign("secret-a", br#"{"event":"qr"}"#);
    assert_ne!(a, c, "different bodies must produce different signatures");
}

#[test]
fn envelope_serializes_with_camel_case_instance_id() {
    let event = WebhookEvent {
        event: "state_changed".to_owned(),
        instance_id: "t1".to_owned(),
        data: serde_json::json!({ "state": "active" }),
        timestamp: Utc::now(),
    };

    let value = serde_json::to_value(&event).expect("serializable");
    assert_eq!(value["event"], "state_changed");
    assert_eq!(value["instanceId"], "t1");
    assert_eq!(value["data"]["state"], "active");
    assert!(value["timestamp"].is_string());
}

#[test]
fn signature_header_name_is_stable() {
    // Receivers verify against this exact header; renaming it is a
    // breaking change.
    assert_eq!(SIGNATURE_HEADER, "X-Straylight-Signature");
}
