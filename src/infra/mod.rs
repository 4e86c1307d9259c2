pub mod docker;
pub mod sqlite;
pub mod web;
