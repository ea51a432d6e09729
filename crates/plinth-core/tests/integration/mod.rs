mod arena;
mod driver;
mod handle;
