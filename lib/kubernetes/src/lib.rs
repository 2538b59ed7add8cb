mod client;
mod config;
mod resource;

pub use client::{Client, Error, ListOptions, Status, WatchEvent, WatchOptions};
pub use resource::{ListMeta, ObjectList, ObjectMeta, Resource};
