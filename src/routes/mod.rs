pub mod announcements;
pub mod attendance;
pub mod auth;
pub mod belt_tests;
pub mod billing;
pub mod classes;
pub mod events;
pub mod families;
pub mod health;
pub mod notifications;
pub mod posts;
pub mod schools;
pub mod users;
pub mod webhook;
pub mod websocket;
