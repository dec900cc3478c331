mod helpers;

mod configuration;
mod lifecycle;
mod receivers;
mod replication;

fn main() {}
