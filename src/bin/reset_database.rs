#[cfg(feature = "ssr")]
use planning_poker::{establish_connection, reset_database, run_migrations};

#[cfg(feature = "ssr")]
fn main() -> std::process::ExitCode {
    dotenvy::dotenv().ok();
    let Ok(database_url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL must be set in .env.");
        return std::process::ExitCode::FAILURE;
    };

    let result = establish_connection(&database_url).and_then(|mut conn| {
        run_migrations(&mut conn)?;
        reset_database(&mut conn)
    });
    match result {
        Ok(()) => {
            println!("Database has been reset.");
            std::process::ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Failed to reset database: {e}");
            std::process::ExitCode::FAILURE
        }
    }
}

#[cfg(not(feature = "ssr"))]
fn main() {
    println!("This binary requires the 'ssr' feature to be enabled.");
}
