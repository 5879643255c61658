//! Types and wire (de)serialisation for the subset of the DNS message
//! format this resolver needs: header, question, and resource records
//! for A, NS, and AAAA, plus label-compression-aware domain name
//! parsing.

pub mod protocol;
