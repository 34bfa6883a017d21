pub mod live_session;
