//! Push subscription on a Windows Event Log channel (`EvtSubscribe`).

use crate::config::EventMatchCriteria;
use crate::error::PlatformError;
use crate::platform::{EventHandler, EventRecord, EventSource, LiveWatch};
use crate::utils::{from_utf16_ptr, to_utf16};
use std::ffi::c_void;
use std::panic::{AssertUnwindSafe, catch_unwind};
use windows::Win32::Foundation::HANDLE;
use windows::Win32::System::EventLog::*;
use windows::core::PCWSTR;

// Longest string value we are willing to read out of a rendered property.
const MAX_PROPERTY_CHARS: usize = 4096;

struct WatchContext {
    handler: EventHandler,
    render: EVT_HANDLE,
    event_id: u32,
}

struct EventLogWatch {
    subscription: EVT_HANDLE,
    context: *mut WatchContext,
}

// The handles are process-wide kernel objects; the context is only freed here.
unsafe impl Send for EventLogWatch {}

impl LiveWatch for EventLogWatch {
    fn cancel(&mut self) -> Result<(), PlatformError> {
        if self.context.is_null() {
            return Ok(());
        }
        unsafe { EvtClose(self.subscription) }.map_err(|e| PlatformError::Call {
            call: "EvtClose",
            message: e.to_string(),
        })?;
        // EvtClose returns after in-flight callbacks, so the context is unused now.
        let ctx = unsafe { Box::from_raw(self.context) };
        self.context = std::ptr::null_mut();
        let _ = unsafe { EvtClose(ctx.render) };
        Ok(())
    }
}

impl Drop for EventLogWatch {
    fn drop(&mut self) {
        if let Err(e) = self.cancel() {
            tracing::warn!("Leaking event log subscription: {}", e);
        }
    }
}

/// Render the user-data values of `event` as strings (GUIDs included).
unsafe fn render_values(render: EVT_HANDLE, event: EVT_HANDLE) -> Result<Vec<Option<String>>, PlatformError> {
    let call_err = |e: windows::core::Error| PlatformError::Call {
        call: "EvtRender",
        message: e.to_string(),
    };
    let mut used = 0u32;
    let mut count = 0u32;
    // First pass sizes the buffer and fails with ERROR_INSUFFICIENT_BUFFER.
    let _ = unsafe {
        EvtRender(render, event, EvtRenderEventValues.0 as u32, 0, None, &mut used, &mut count)
    };
    if used == 0 {
        return Ok(Vec::new());
    }
    let mut buf = vec![0u64; (used as usize).div_ceil(8)];
    unsafe {
        EvtRender(
            render,
            event,
            EvtRenderEventValues.0 as u32,
            (buf.len() * 8) as u32,
            Some(buf.as_mut_ptr() as *mut c_void),
            &mut used,
            &mut count,
        )
    }
    .map_err(call_err)?;

    let values = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const EVT_VARIANT, count as usize) };
    Ok(values
        .iter()
        .map(|v| unsafe {
            match EVT_VARIANT_TYPE(v.Type as i32) {
                EvtVarTypeString => from_utf16_ptr(v.Anonymous.StringVal.0, MAX_PROPERTY_CHARS),
                EvtVarTypeGuid if !v.Anonymous.GuidVal.is_null() => {
                    Some(format!("{:?}", *v.Anonymous.GuidVal))
                }
                _ => None,
            }
        })
        .collect())
}

unsafe extern "system" fn on_event(
    action: EVT_SUBSCRIBE_NOTIFY_ACTION,
    context: *const c_void,
    event: EVT_HANDLE,
) -> u32 {
    let ctx = unsafe { &*(context as *const WatchContext) };
    if action == EvtSubscribeActionError {
        // For errors the "event" handle carries a Win32 status code.
        tracing::error!("Event log subscription reported error {}", event.0 as u32);
        return 0;
    }
    match unsafe { render_values(ctx.render, event) } {
        Ok(properties) => {
            let record = EventRecord::new(ctx.event_id, properties);
            if catch_unwind(AssertUnwindSafe(|| (ctx.handler)(record))).is_err() {
                tracing::error!("Event handler panicked; event dropped");
            }
        }
        Err(e) => tracing::warn!("Dropping event {}: {}", ctx.event_id, e),
    }
    0
}

/// Event source backed by the local Windows Event Log service.
#[derive(Debug, Default)]
pub struct WindowsEventLog;

impl EventSource for WindowsEventLog {
    fn watch(
        &self,
        criteria: &EventMatchCriteria,
        handler: EventHandler,
    ) -> Result<Box<dyn LiveWatch>, PlatformError> {
        let channel = to_utf16(criteria.channel);
        let query = to_utf16(&criteria.xpath_query());
        unsafe {
            let render = EvtCreateRenderContext(None, EvtRenderContextUser.0 as u32).map_err(|e| {
                PlatformError::Call {
                    call: "EvtCreateRenderContext",
                    message: e.to_string(),
                }
            })?;
            let context = Box::into_raw(Box::new(WatchContext {
                handler,
                render,
                event_id: criteria.event_id,
            }));
            let subscription = EvtSubscribe(
                EVT_HANDLE::default(),
                HANDLE::default(),
                PCWSTR(channel.as_ptr()),
                PCWSTR(query.as_ptr()),
                EVT_HANDLE::default(),
                Some(context as *const c_void),
                Some(on_event),
                EvtSubscribeToFutureEvents.0 as u32,
            );
            match subscription {
                Ok(subscription) => Ok(Box::new(EventLogWatch {
                    subscription,
                    context,
                })),
                Err(e) => {
                    drop(Box::from_raw(context));
                    let _ = EvtClose(render);
                    Err(PlatformError::Call {
                        call: "EvtSubscribe",
                        message: format!("{} ({})", e, criteria.channel),
                    })
                }
            }
        }
    }
}
