// src/port/outport.rs

use std::collections::HashMap;

use serde_json::Value;
use tracing::trace;

use super::{Attachments, Detached, NamedPort, PortOptions};
use crate::{
    error::{ProcessError, ValidationError},
    ip::Ip,
    socket::{SocketId, Sockets},
};

/// Sending side of a component.
#[derive(Debug, Clone)]
pub struct OutPort {
    name: String,
    options: PortOptions,
    caching: bool,
    sockets: Attachments,
    cache: HashMap<Option<usize>, Ip>,
}

impl OutPort {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: PortOptions::default(),
            caching: false,
            sockets: Attachments::default(),
            cache: HashMap::new(),
        }
    }

    pub fn datatype(mut self, datatype: impl Into<String>) -> Self {
        self.options.datatype = datatype.into();
        self
    }

    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.options.schema = Some(schema.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.options.description = description.into();
        self
    }

    pub fn addressable(mut self) -> Self {
        self.options.addressable = true;
        self
    }

    pub fn required(mut self) -> Self {
        self.options.required = true;
        self
    }

    pub fn unscoped(mut self) -> Self {
        self.options.scoped = false;
        self
    }

    /// Remember the last packet per index and replay it to late attachments.
    pub fn caching(mut self) -> Self {
        self.caching = true;
        self
    }

    pub fn options(&self) -> &PortOptions {
        &self.options
    }

    pub fn is_addressable(&self) -> bool {
        self.options.addressable
    }

    pub fn is_caching(&self) -> bool {
        self.caching
    }

    pub fn is_required(&self) -> bool {
        self.options.required
    }

    pub fn is_scoped(&self) -> bool {
        self.options.scoped
    }

    fn cache_key(&self, index: Option<usize>) -> Option<usize> {
        if self.options.addressable { index } else { None }
    }

    pub fn attach(
        &mut self,
        sockets: &mut Sockets,
        socket: SocketId,
        index: Option<usize>,
    ) -> Result<usize, ProcessError> {
        let index = self.sockets.attach(&self.name, socket, index)?;
        if self.caching {
            if let Some(cached) = self.cache.get(&self.cache_key(Some(index))) {
                trace!(port = %self.name, index, "replaying cached packet");
                sockets.post(socket, cached.clone())?;
            }
        }
        Ok(index)
    }

    pub fn detach(&mut self, socket: SocketId) -> Result<Detached, ValidationError> {
        self.sockets.detach(&self.name, socket)
    }

    pub fn list_attached(&self) -> Vec<usize> {
        self.sockets.indices()
    }

    pub fn is_attached(&self, index: Option<usize>) -> bool {
        match index {
            Some(index) => self.sockets.contains(index),
            None => !self.sockets.is_empty(),
        }
    }

    pub fn send(
        &mut self,
        sockets: &mut Sockets,
        data: impl Into<Value>,
        index: Option<usize>,
    ) -> Result<(), ProcessError> {
        self.send_ip(sockets, Ip::data(data), index)
    }

    /// Deliver to the socket at `index`, or to every attached socket when the
    /// port is not addressable. Only extra receivers of a clonable packet get
    /// their own copy.
    pub fn send_ip(
        &mut self,
        sockets: &mut Sockets,
        mut ip: Ip,
        index: Option<usize>,
    ) -> Result<(), ProcessError> {
        let index = if self.options.addressable {
            match index.or(ip.index()) {
                Some(index) => Some(index),
                None => {
                    return Err(ValidationError::MissingIndex { port: self.name.clone() }.into());
                }
            }
        } else if index.is_some() {
            return Err(ValidationError::NotAddressable { port: self.name.clone() }.into());
        } else {
            None
        };
        if self.options.required && self.sockets.is_empty() {
            return Err(ValidationError::RequiredNotAttached { port: self.name.clone() }.into());
        }

        if ip.datatype().is_none() && self.options.datatype != "all" {
            ip.set_datatype(Some(self.options.datatype.clone()));
        }
        if ip.schema().is_none() {
            ip.set_schema(self.options.schema.clone());
        }
        if !self.options.scoped {
            ip.set_scope(None);
        }
        ip.set_index(index);

        if self.caching {
            self.cache.insert(self.cache_key(index), ip.clone());
        }

        let targets: Vec<SocketId> = match index {
            Some(index) => vec![self.sockets.get(index).ok_or_else(|| {
                ValidationError::UnknownIndex {
                    port: self.name.clone(),
                    index,
                }
            })?],
            None => self.sockets.sockets().map(|(_, socket)| socket).collect(),
        };

        for (position, socket) in targets.into_iter().enumerate() {
            let packet = if position > 0 && ip.is_clonable() {
                ip.deep_clone()
            } else {
                ip.clone()
            };
            sockets.post(socket, packet)?;
        }
        Ok(())
    }

    pub fn disconnect(
        &mut self,
        sockets: &mut Sockets,
        index: Option<usize>,
    ) -> Result<(), ProcessError> {
        match index {
            Some(index) => {
                if let Some(socket) = self.sockets.get(index) {
                    sockets.disconnect(socket)?;
                }
            }
            None => {
                for (_, socket) in self.sockets.sockets() {
                    sockets.disconnect(socket)?;
                }
            }
        }
        Ok(())
    }
}

impl NamedPort for OutPort {
    fn name(&self) -> &str {
        &self.name
    }
}
