mod data_io;
mod errors;
mod extract;
mod page_size;
mod paginate;
mod region;
mod runtime;
mod types;
mod wait;
mod webdriver;

#[cfg(test)]
mod testing;

pub use runtime::run;
