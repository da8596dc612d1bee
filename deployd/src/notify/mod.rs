//! Completion notifications

pub mod dispatcher;
pub mod mailer;
