pub mod shell;
pub mod supervisor;

pub use shell::{ShellFlavor, ShellSpec};
pub use supervisor::{Supervisor, SupervisorOptions};
