//! Operator authentication

pub mod token;
