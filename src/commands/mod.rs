pub mod chart_session;
