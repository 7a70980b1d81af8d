pub mod admin;
pub mod device;
pub mod health;
pub mod oauth;
pub mod pages;
pub mod patrols;
