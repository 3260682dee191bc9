//! This crate holds the protocol vocabulary of `scriptgate`, a server that
//! exposes a directory of command-line scripts as HTTP endpoints.
//! The canonical server implementation lives in the same repository.
//!
//! ## Routes
//! Every file whose base name is an HTTP verb becomes a route:
//! `commands/hello/get.sh` answers `GET /hello`, `commands/users/:id/delete.py`
//! answers `DELETE /users/{id}`. A file named `all.*` answers every method
//! not claimed by a sibling verb file. See [`api::Verb`].
//!
//! ## Arguments
//! Request data is passed to the command as `--name value` flags, from lowest
//! to highest precedence:
//! * headers named `X-Arg-<name>`,
//! * query parameters,
//! * path parameters,
//! * body fields (nested values are flattened to `a.b.0` keys),
//! * uploaded files, mapped to the path of a temporary copy.
//!
//! ## Exit codes
//! The exit code of the command decides the shape of the response,
//! see [`api::ExitCodePolicy`]:
//! * `0` is a success, the output is returned as JSON.
//! * `11` is a handled error, the output is returned as JSON with `success: false`.
//! * `10` means the output is a path to a file that is sent as a download.
//! * anything else is reported as a plain text `500` response.
//!
//! Every response except `404` carries an [`X-Success`](api::SUCCESS_HEADER) header.
//!
//! ## Security
//! A single static bearer token can be required for all routes. It is read
//! from the `access_token` body field, the `access_token` query parameter or
//! the `Authorization: Bearer` header, in that order.
//! Beyond that this is *remote execution as a service!* Only expose scripts
//! you would be happy to run with arbitrary arguments.

pub mod api;
