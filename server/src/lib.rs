pub mod auth;
pub mod cache;
pub mod cluster_singleton;
pub mod config;
pub mod db;
pub mod dice;
pub mod error;
pub mod game_pieces;
pub mod game_server;
pub mod gateway;
pub mod matchmaking;
pub mod matchmaking_manager;
pub mod move_buffer;
pub mod player_connections;
pub mod redis_keys;
pub mod redis_utils;
pub mod scheduler;
pub mod session_registry;
pub mod transition;
