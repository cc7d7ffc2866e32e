pub mod authz;
pub mod boot;
pub mod config;
pub mod error;
pub mod gc;
pub mod graph;
pub mod naming;
pub mod pooladapter;
pub mod properties;
pub mod state;
pub mod sys;
pub mod tx;

#[cfg(test)]
mod tests {
    pub mod prelude {
        pub use indoc::indoc;
        pub use serial_test::serial;
    }
}
