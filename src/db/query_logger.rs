use diesel::connection::{Instrumentation, InstrumentationEvent};
use std::{
    collections::HashMap,
    sync::{LazyLock, Mutex},
    thread,
    time::Instant,
};

static QUERY_PERF_TRACKER: LazyLock<Mutex<HashMap<(thread::ThreadId, String), Instant>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

pub fn simple_logger() -> Option<Box<dyn Instrumentation>> {
    Some(Box::new(|event: InstrumentationEvent<'_>| match event {
        InstrumentationEvent::StartEstablishConnection {
            url,
            ..
        } => {
            debug!("Establishing connection: {url}")
        }
        InstrumentationEvent::FinishEstablishConnection {
            url,
            error,
            ..
        } => {
            if let Some(e) = error {
                error!("Error during establishing a connection with {url}: {e:?}")
            } else {
                debug!("Connection established: {url}")
            }
        }
        InstrumentationEvent::StartQuery {
            query,
            ..
        } => {
            let query_string = format!("{query:?}");
            if let Ok(mut tracker) = QUERY_PERF_TRACKER.lock() {
                tracker.insert((thread::current().id(), query_string), Instant::now());
            }
        }
        InstrumentationEvent::FinishQuery {
            query,
            ..
        } => {
            let query_string = format!("{query:?}");
            let start = QUERY_PERF_TRACKER.lock().ok().and_then(|mut t| t.remove(&(thread::current().id(), query_string.clone())));
            if let Some(start) = start {
                let duration = start.elapsed();
                if duration.as_secs() >= 5 {
                    warn!("SLOW QUERY [{:.2}s]: {}", duration.as_secs_f32(), query_string);
                } else if duration.as_secs() >= 1 {
                    info!("SLOW QUERY [{:.2}s]: {}", duration.as_secs_f32(), query_string);
                } else {
                    debug!("QUERY [{duration:?}]: {query_string}");
                }
            }
        }
        _ => {}
    }))
}
