pub mod csv_dump;
pub mod debounce;
pub mod game;
pub mod game_socket;
