mod config;
mod lifecycle;
mod scenario;
mod simulator;
