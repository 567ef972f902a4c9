#[macro_use]
extern crate rocket;

#[launch]
fn rocket() -> _ {
    let rocket = mail_ingest::rocket();
    log::info!("starting mail ingest server");
    rocket
}
