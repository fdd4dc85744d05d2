//! Resource URIs.
//!
//! URIs are the stable routing key handed to the interceptor and used as a
//! logging label. Data operations use `urn:postgres:<nss>.<resource>`.

pub const POSTGRES_NID: &str = "postgres";
pub const QUERY_NSS: &str = "query";
pub const INSERT_NSS: &str = "insert";
pub const UPDATE_NSS: &str = "update";
pub const DELETE_NSS: &str = "delete";
pub const PING_NSS: &str = "ping";
pub const STAT_NSS: &str = "stat";

pub const PING_URI: &str = "urn:postgres:ping";
pub const STAT_URI: &str = "urn:postgres:stat";

fn build_uri(nid: &str, nss: &str, resource: &str) -> String {
    format!("urn:{}:{}.{}", nid, nss, resource)
}

pub fn build_query_uri(resource: &str) -> String {
    build_uri(POSTGRES_NID, QUERY_NSS, resource)
}

pub fn build_insert_uri(resource: &str) -> String {
    build_uri(POSTGRES_NID, INSERT_NSS, resource)
}

pub fn build_update_uri(resource: &str) -> String {
    build_uri(POSTGRES_NID, UPDATE_NSS, resource)
}

pub fn build_delete_uri(resource: &str) -> String {
    build_uri(POSTGRES_NID, DELETE_NSS, resource)
}
