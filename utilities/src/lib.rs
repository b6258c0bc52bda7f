pub mod command_executor;
pub mod modbus;
pub mod tcp_link;
