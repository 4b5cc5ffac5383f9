mod health;
mod instances;
mod routes;

pub use routes::create_router;
