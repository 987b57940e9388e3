pub mod login_log;
pub mod session;
pub mod session_setting;
