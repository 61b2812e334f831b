use super::*;

use std::io;

#[cfg(unix)]
#[test]
fn descriptor_and_buffer_exhaustion_count_as_resource_exhaustion() {
    for errno in [ENOMEM, ENFILE, EMFILE, ENOBUFS] {
        assert!(
            is_exhausted_io(&io::Error::from_raw_os_error(errno)),
            "errno {errno}"
        );
    }
}

#[test]
fn ordinary_io_failures_are_not_exhaustion() {
    assert!(is_exhausted_io(&io::Error::from(io::ErrorKind::OutOfMemory)));
    assert!(!is_exhausted_io(&io::Error::from(io::ErrorKind::ConnectionRefused)));
    assert!(!is_exhausted_io(&io::Error::new(io::ErrorKind::Other, "tls")));
}

#[test]
fn business_detail_reads_rest_error_body() {
    let rejected = BusinessError {
        status: 409,
        body: r#"{"detail":"submission already approved"}"#.to_string(),
    };
    assert_eq!(
        rejected.detail().as_deref(),
        Some("submission already approved")
    );

    let html = BusinessError {
        status: 502,
        body: "<html>bad gateway</html>".to_string(),
    };
    assert_eq!(html.detail(), None);
}

#[test]
fn transport_errors_carry_a_user_hint() {
    let err = TransportError::new(TransportErrorCode::ResourceExhausted);
    assert_eq!(err.code, TransportErrorCode::ResourceExhausted);
    assert_eq!(err.message, TransportErrorCode::ResourceExhausted.hint());
}
