// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn glasses_token_round_trips() -> anyhow::Result<()> {
    let token = sign("secret", &GlassesClaims { email: "alice@example.com".into() })?;
    let claims: GlassesClaims = verify("secret", &token)?;
    assert_eq!(claims.email, "alice@example.com");
    Ok(())
}

#[test]
fn app_token_round_trips() -> anyhow::Result<()> {
    let token = sign(
        "secret",
        &AppClaims { package_name: "com.example.captions".into(), api_key: "k1".into() },
    )?;
    let claims: AppClaims = verify("secret", &token)?;
    assert_eq!(claims.package_name, "com.example.captions");
    assert_eq!(claims.api_key, "k1");
    Ok(())
}

#[test]
fn wrong_secret_rejected() -> anyhow::Result<()> {
    let token = sign("secret", &GlassesClaims { email: "a@b.c".into() })?;
    let err = verify::<GlassesClaims>("other", &token).unwrap_err();
    assert_eq!(err, TokenError::BadSignature);
    Ok(())
}

#[test]
fn tampered_payload_rejected() -> anyhow::Result<()> {
    let token = sign("secret", &GlassesClaims { email: "a@b.c".into() })?;
    let (_, tag) = token.split_once('.').unwrap();
    let forged_payload = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .encode(br#"{"email":"mallory@evil.example"}"#);
    let err = verify::<GlassesClaims>("secret", &format!("{forged_payload}.{tag}")).unwrap_err();
    assert_eq!(err, TokenError::BadSignature);
    Ok(())
}

#[test]
fn garbage_is_malformed() {
    assert_eq!(verify::<GlassesClaims>("secret", "not-a-token").unwrap_err(), TokenError::Malformed);
    assert_eq!(verify::<GlassesClaims>("secret", "a.b.c").unwrap_err(), TokenError::Malformed);
}
