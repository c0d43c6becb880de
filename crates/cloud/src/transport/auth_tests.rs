// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use axum::http::HeaderValue;

#[test]
fn constant_time_eq_basics() {
    assert!(constant_time_eq("abc", "abc"));
    assert!(!constant_time_eq("abc", "abd"));
    assert!(!constant_time_eq("abc", "abcd"));
    assert!(constant_time_eq("", ""));
}

#[test]
fn bearer_accepts_matching_token() {
    let mut headers = HeaderMap::new();
    headers.insert("authorization", HeaderValue::from_static("Bearer s3cret"));
    assert!(validate_bearer(&headers, Some("s3cret")).is_ok());
}

#[test]
fn bearer_rejects_wrong_or_missing_token() {
    let mut headers = HeaderMap::new();
    headers.insert("authorization", HeaderValue::from_static("Bearer nope"));
    assert_eq!(validate_bearer(&headers, Some("s3cret")), Err(CloudError::Unauthorized));

    let empty = HeaderMap::new();
    assert_eq!(validate_bearer(&empty, Some("s3cret")), Err(CloudError::Unauthorized));
}

#[test]
fn bearer_open_when_no_token_configured() {
    let empty = HeaderMap::new();
    assert!(validate_bearer(&empty, None).is_ok());
}
