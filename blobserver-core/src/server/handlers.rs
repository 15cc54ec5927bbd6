//! Control-message handlers.
//!
//! Each handler validates its message, applies the mutation and returns the
//! reply to send (client + payload), or `None` when the request warrants no
//! reply — an unparseable return address, or a request naming a flow id that
//! does not exist (which no-ops by policy).  Keeping socket writes out of the
//! handlers lets tests drive them directly.
//!
//! Reply routing: once a request resolves to a flow, every reply rides that
//! flow's own client — the endpoint given at connect time.  The default-port
//! endpoint built from the request's address field only carries errors raised
//! before any flow is looked up.

use std::sync::{Arc, Mutex};

use crate::message::Message;
use crate::runtime::{App, Flow};
use crate::server::{OscClient, CLIENT_PORT};
use crate::shm::{output_path, ShmImage};
use crate::source::Source;

type Reply = Option<(Arc<OscClient>, Message)>;

fn error_reply(client: Arc<OscClient>, text: &str) -> Reply {
    Some((client, crate::message![text]))
}

/// `/blobserver/connect <ip> <port> <detector> (<source> <subsource>)+`
pub fn connect(app: &Arc<App>, message: &Message) -> Reply {
    let address = message.str_at(0).ok()?;
    let port = message.int_at(1).ok()?.clamp(1, u16::MAX as i32) as u16;
    let client = Arc::new(OscClient::new(address, port, app.tcp).ok()?);

    if message.len() < 5 {
        return error_reply(client, "Too few arguments");
    }

    let Ok(detector_name) = message.str_at(2) else {
        return error_reply(client, "Expected a detector type at position 2");
    };
    let Some(mut detector) = app.detector_factory.create(detector_name, 0) else {
        return error_reply(client, "Detector type not recognized");
    };

    // All checks and mutations below happen under both locks, flow lock
    // first, so a half-validated connect can never race another handler.
    let mut flows = app.flows.lock().expect("flow lock poisoned");
    let mut registered = app.sources.lock().expect("source lock poisoned");

    // Resolve the requested sources, reusing an already-registered source
    // when class name and sub-source index both match.
    let mut sources: Vec<Arc<Mutex<dyn Source + Send>>> = Vec::new();
    let mut index = 3;
    while index < message.len() {
        if index + 1 >= message.len() {
            return error_reply(client, "Missing sub-source number");
        }
        let Ok(source_name) = message.str_at(index) else {
            return error_reply(client, "Expected a source name");
        };
        let Ok(subsource) = message.int_at(index + 1) else {
            return error_reply(client, "Expected integer as a sub-source number");
        };
        index += 2;

        // Same physical source: class name and sub-source index both match.
        // Look at the sources resolved so far too, in case one request names
        // the same pair twice.
        let same_source = |candidate: &&Arc<Mutex<dyn Source + Send>>| {
            let candidate = candidate.lock().expect("source poisoned");
            candidate.name() == source_name && candidate.subsource_nbr() == subsource
        };
        if let Some(source) = sources.iter().find(same_source) {
            let source = Arc::clone(source);
            sources.push(source);
            continue;
        }
        if let Some(source) = registered.iter().find(same_source) {
            sources.push(Arc::clone(source));
            continue;
        }

        let Some(source) = app.source_factory.create(source_name, subsource) else {
            return error_reply(client, &format!("Unable to create source {source_name}"));
        };
        if !source.lock().expect("source poisoned").connect() {
            return error_reply(client, &format!("Unable to connect to source {source_name}"));
        }
        sources.push(source);
    }

    if (sources.len() as u32) < detector.source_nbr() {
        return error_reply(client, "The specified detector needs more sources");
    }

    let id = app.valid_id();
    let shm = match ShmImage::open(output_path(id)) {
        Ok(shm) => shm,
        Err(err) => {
            tracing::warn!(flow = id, error = %err, "could not open output channel");
            return error_reply(client, "Unable to open the output channel");
        }
    };

    if let Some(mask) = app.mask.lock().expect("mask lock poisoned").as_ref() {
        detector.set_mask(mask.clone());
    }

    for source in &sources {
        let already_registered = registered.iter().any(|candidate| Arc::ptr_eq(candidate, source));
        if !already_registered {
            registered.push(Arc::clone(source));
        }
        // Weak reference only: the detector must not keep the source alive.
        detector.add_source(Arc::downgrade(source));
    }

    flows.push(Flow {
        id,
        detector,
        sources,
        client: Arc::clone(&client),
        shm,
        run: false,
    });

    tracing::info!(flow = id, client = %client.address(), "flow connected");
    Some((client, crate::message!["Connected", id as i32]))
}

/// `/blobserver/disconnect <ip> [<flow-id>]`
pub fn disconnect(app: &Arc<App>, message: &Message) -> Reply {
    let address = message.str_at(0).ok()?;
    let client = Arc::new(OscClient::new(address, CLIENT_PORT, app.tcp).ok()?);

    if message.len() > 2 {
        return error_reply(client, "Wrong number of arguments");
    }
    let flow_id = if message.len() == 2 {
        match message.int_at(1) {
            Ok(id) => Some(id),
            Err(_) => return error_reply(client, "Expected an integer flow id"),
        }
    } else {
        None
    };

    let mut removed = 0usize;
    {
        let mut flows = app.flows.lock().expect("flow lock poisoned");
        flows.retain(|flow| {
            let matches = flow.client.address() == client.address()
                && flow_id.map(|id| id == flow.id as i32).unwrap_or(true);
            if matches {
                // The ack goes out on the flow's own endpoint, here and only
                // here; orphaned sources are reaped by the next grab sweep.
                flow.client
                    .send(super::PATH_DISCONNECT, &crate::message!["Disconnected"]);
                tracing::info!(flow = flow.id, client = %client.address(), "flow disconnected");
                removed += 1;
            }
            !matches
        });
    }

    if removed == 0 {
        tracing::debug!(client = %client.address(), "disconnect matched no flow");
    }
    None
}

/// `/blobserver/setParameter <ip> <flow-id> ("Detector" ...)|("Source" ...)|"Start"|"Stop"`
pub fn set_parameter(app: &Arc<App>, message: &Message) -> Reply {
    let address = message.str_at(0).ok()?;
    let client = Arc::new(OscClient::new(address, CLIENT_PORT, app.tcp).ok()?);

    if message.len() < 3 {
        return error_reply(client, "Wrong number of arguments");
    }
    let Ok(flow_id) = message.int_at(1) else {
        return error_reply(client, "Expected an integer flow id");
    };
    let Ok(entity) = message.str_at(2) else {
        return error_reply(client, "Expected a target entity");
    };

    let mut flows = app.flows.lock().expect("flow lock poisoned");
    // An unknown flow id is a silent no-op: the loop just finds no match.
    let Some(flow) = flows.iter_mut().find(|flow| flow.id as i32 == flow_id) else {
        return None;
    };

    match entity {
        "Detector" => {
            if message.len() < 5 {
                return error_reply(Arc::clone(&flow.client), "Wrong number of arguments");
            }
            flow.detector.set_parameter(&message.slice(3, message.len()));
            None
        }
        "Source" => {
            if message.len() < 6 {
                return error_reply(Arc::clone(&flow.client), "Wrong number of arguments");
            }
            let Ok(source_index) = message.int_at(3) else {
                return error_reply(Arc::clone(&flow.client), "Expected an integer source index");
            };
            let Some(source) = usize::try_from(source_index)
                .ok()
                .and_then(|idx| flow.sources.get(idx))
            else {
                return error_reply(Arc::clone(&flow.client), "Wrong source index");
            };
            source
                .lock()
                .expect("source poisoned")
                .set_parameter(&message.slice(4, message.len()));
            None
        }
        "Start" => {
            flow.run = true;
            tracing::info!(flow = flow.id, "flow started");
            None
        }
        "Stop" => {
            flow.run = false;
            tracing::info!(flow = flow.id, "flow stopped");
            None
        }
        _ => error_reply(Arc::clone(&flow.client), "Unknown target entity"),
    }
}

/// `/blobserver/getParameter <ip> <flow-id> "Detector"|"Sources" [<src-idx>] <name>`
pub fn get_parameter(app: &Arc<App>, message: &Message) -> Reply {
    let address = message.str_at(0).ok()?;
    let client = Arc::new(OscClient::new(address, CLIENT_PORT, app.tcp).ok()?);

    if message.len() < 4 {
        return error_reply(client, "Wrong number of arguments");
    }
    let Ok(flow_id) = message.int_at(1) else {
        return error_reply(client, "Expected an integer flow id");
    };
    let Ok(entity) = message.str_at(2) else {
        return error_reply(client, "Expected a target entity");
    };

    let mut flows = app.flows.lock().expect("flow lock poisoned");
    let Some(flow) = flows.iter_mut().find(|flow| flow.id as i32 == flow_id) else {
        return None;
    };

    match entity {
        "Detector" => {
            let Ok(name) = message.str_at(3) else {
                return error_reply(Arc::clone(&flow.client), "Expected a parameter name");
            };
            let reply = flow.detector.get_parameter(&crate::message![name]);
            Some((Arc::clone(&flow.client), reply))
        }
        "Sources" => {
            if message.len() < 5 {
                return error_reply(Arc::clone(&flow.client), "Wrong number of arguments");
            }
            let Ok(source_index) = message.int_at(3) else {
                return error_reply(Arc::clone(&flow.client), "Expected an integer source index");
            };
            let Ok(name) = message.str_at(4) else {
                return error_reply(Arc::clone(&flow.client), "Expected a parameter name");
            };
            let Some(source) = usize::try_from(source_index)
                .ok()
                .and_then(|idx| flow.sources.get(idx))
            else {
                return error_reply(Arc::clone(&flow.client), "Wrong source index");
            };
            let reply = source
                .lock()
                .expect("source poisoned")
                .get_parameter(&crate::message![name]);
            Some((Arc::clone(&flow.client), reply))
        }
        _ => error_reply(Arc::clone(&flow.client), "Unknown target entity"),
    }
}

/// `/blobserver/detectors <ip>` — enumerate registered detector classes.
pub fn detectors(app: &Arc<App>, message: &Message) -> Reply {
    let address = message.str_at(0).ok()?;
    let client = Arc::new(OscClient::new(address, CLIENT_PORT, app.tcp).ok()?);
    let reply: Message = app.detector_factory.get_keys().into_iter().collect();
    Some((client, reply))
}

/// `/blobserver/sources <ip> [<source-name>]` — enumerate source classes, or
/// the sub-sources of one class.
pub fn sources(app: &Arc<App>, message: &Message) -> Reply {
    let address = message.str_at(0).ok()?;
    let client = Arc::new(OscClient::new(address, CLIENT_PORT, app.tcp).ok()?);

    if message.len() > 1 {
        let Ok(name) = message.str_at(1) else {
            return error_reply(client, "Expected a source name");
        };
        // Probe instance: sub-source −1 enumerates without opening a device.
        let Some(probe) = app.source_factory.create(name, -1) else {
            return error_reply(client, "Source type not recognized");
        };
        let reply = probe.lock().expect("source poisoned").get_subsources();
        return Some((client, reply));
    }

    let reply: Message = app.source_factory.get_keys().into_iter().collect();
    Some((client, reply))
}
