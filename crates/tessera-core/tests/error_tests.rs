use axum::http::StatusCode;
use axum::response::IntoResponse;
use tessera_core::TesseraError;

#[test]
fn test_status_codes() {
    assert_eq!(TesseraError::Authentication.status_code(), StatusCode::UNAUTHORIZED);
    assert_eq!(TesseraError::SessionExpired.status_code(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        TesseraError::Security("locked".into()).status_code(),
        StatusCode::TOO_MANY_REQUESTS
    );
    assert_eq!(
        TesseraError::RecordNotFound("session 1".into()).status_code(),
        StatusCode::NOT_FOUND
    );
    assert_eq!(
        TesseraError::Internal("boom".into()).status_code(),
        StatusCode::INTERNAL_SERVER_ERROR
    );
}

#[test]
fn test_expired_and_unknown_look_the_same() {
    let a = TesseraError::Authentication;
    let b = TesseraError::SessionExpired;
    assert_eq!(a.error_code(), b.error_code());
    assert_eq!(a.public_message(), b.public_message());
}

#[test]
fn test_internal_details_are_hidden() {
    let err = TesseraError::Store(sea_orm::DbErr::Custom("password=hunter2".into()));
    assert_eq!(err.public_message(), "Internal server error");
    assert_eq!(err.error_code(), "STORE_ERROR");

    let response = err.into_response();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}
