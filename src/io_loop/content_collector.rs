use crate::{AmqpProperties, Delivery, Error, Get, Result, Return};
use amq_protocol::frame::AMQPContentHeader;
use amq_protocol::protocol::basic::Deliver;
use amq_protocol::protocol::basic::GetOk as AmqpGetOk;
use amq_protocol::protocol::basic::Return as AmqpReturn;

/// Reassembles a server-pushed method plus its content header and body
/// frames into one complete message. At most one piece of content can be in
/// flight per channel; the server interleaving anything else is a protocol
/// error.
pub(super) struct ContentCollector {
    kind: Option<Kind>,
}

pub(super) enum CollectorResult {
    Delivery((String, Delivery)),
    Return(Return),
    Get(Get),
}

impl ContentCollector {
    pub(super) fn new() -> ContentCollector {
        ContentCollector { kind: None }
    }

    pub(super) fn collect_deliver(&mut self, deliver: Deliver) -> Result<()> {
        match self.kind.take() {
            None => {
                self.kind = Some(Kind::Delivery(State::Start(deliver)));
                Ok(())
            }
            Some(_) => Err(Error::FrameUnexpected),
        }
    }

    pub(super) fn collect_return(&mut self, return_: AmqpReturn) -> Result<()> {
        match self.kind.take() {
            None => {
                self.kind = Some(Kind::Return(State::Start(return_)));
                Ok(())
            }
            Some(_) => Err(Error::FrameUnexpected),
        }
    }

    pub(super) fn collect_get(&mut self, get_ok: AmqpGetOk) -> Result<()> {
        match self.kind.take() {
            None => {
                self.kind = Some(Kind::Get(State::Start(get_ok)));
                Ok(())
            }
            Some(_) => Err(Error::FrameUnexpected),
        }
    }

    pub(super) fn collect_header(
        &mut self,
        header: AMQPContentHeader,
    ) -> Result<Option<CollectorResult>> {
        match self.kind.take() {
            Some(kind) => match kind.collect_header(header)? {
                Collected::Done(result) => Ok(Some(result)),
                Collected::NeedMore(kind) => {
                    self.kind = Some(kind);
                    Ok(None)
                }
            },
            None => Err(Error::FrameUnexpected),
        }
    }

    pub(super) fn collect_body(&mut self, body: Vec<u8>) -> Result<Option<CollectorResult>> {
        match self.kind.take() {
            Some(kind) => match kind.collect_body(body)? {
                Collected::Done(result) => Ok(Some(result)),
                Collected::NeedMore(kind) => {
                    self.kind = Some(kind);
                    Ok(None)
                }
            },
            None => Err(Error::FrameUnexpected),
        }
    }
}

enum Kind {
    Delivery(State<Deliver>),
    Return(State<AmqpReturn>),
    Get(State<AmqpGetOk>),
}

enum Collected {
    Done(CollectorResult),
    NeedMore(Kind),
}

impl Kind {
    fn collect_header(self, header: AMQPContentHeader) -> Result<Collected> {
        match self {
            Kind::Delivery(state) => state
                .collect_header(header)
                .map(|c| c.map_content(Kind::Delivery, finish_delivery)),
            Kind::Return(state) => state
                .collect_header(header)
                .map(|c| c.map_content(Kind::Return, finish_return)),
            Kind::Get(state) => state
                .collect_header(header)
                .map(|c| c.map_content(Kind::Get, finish_get)),
        }
    }

    fn collect_body(self, body: Vec<u8>) -> Result<Collected> {
        match self {
            Kind::Delivery(state) => state
                .collect_body(body)
                .map(|c| c.map_content(Kind::Delivery, finish_delivery)),
            Kind::Return(state) => state
                .collect_body(body)
                .map(|c| c.map_content(Kind::Return, finish_return)),
            Kind::Get(state) => state
                .collect_body(body)
                .map(|c| c.map_content(Kind::Get, finish_get)),
        }
    }
}

fn finish_delivery(deliver: Deliver, buf: Vec<u8>, properties: AmqpProperties) -> CollectorResult {
    CollectorResult::Delivery(Delivery::new(deliver, buf, properties))
}

fn finish_return(ret: AmqpReturn, buf: Vec<u8>, properties: AmqpProperties) -> CollectorResult {
    CollectorResult::Return(Return::new(ret, buf, properties))
}

fn finish_get(get_ok: AmqpGetOk, buf: Vec<u8>, properties: AmqpProperties) -> CollectorResult {
    let message_count = get_ok.message_count;
    let delivery = Delivery::new_get_ok(get_ok, buf, properties);
    CollectorResult::Get(Get {
        delivery,
        message_count,
    })
}

enum Content<M> {
    Done(M, Vec<u8>, AmqpProperties),
    NeedMore(State<M>),
}

impl<M> Content<M> {
    fn map_content<K, F>(self, wrap: K, finish: F) -> Collected
    where
        K: FnOnce(State<M>) -> Kind,
        F: FnOnce(M, Vec<u8>, AmqpProperties) -> CollectorResult,
    {
        match self {
            Content::Done(method, buf, properties) => {
                Collected::Done(finish(method, buf, properties))
            }
            Content::NeedMore(state) => Collected::NeedMore(wrap(state)),
        }
    }
}

// Clippy warns about State::Body being much larger than the other variant, but we
// expect almost all instances of State to transition to Body.
#[allow(clippy::large_enum_variant)]
enum State<M> {
    Start(M),
    Body(M, AMQPContentHeader, Vec<u8>),
}

impl<M> State<M> {
    fn collect_header(self, header: AMQPContentHeader) -> Result<Content<M>> {
        match self {
            State::Start(method) => {
                if header.body_size == 0 {
                    Ok(Content::Done(method, Vec::new(), header.properties))
                } else {
                    let buf = Vec::with_capacity(header.body_size as usize);
                    Ok(Content::NeedMore(State::Body(method, header, buf)))
                }
            }
            State::Body(_, _, _) => Err(Error::FrameUnexpected),
        }
    }

    fn collect_body(self, mut body: Vec<u8>) -> Result<Content<M>> {
        match self {
            State::Body(method, header, mut buf) => {
                let body_size = header.body_size as usize;
                buf.append(&mut body);
                if buf.len() == body_size {
                    Ok(Content::Done(method, buf, header.properties))
                } else if buf.len() < body_size {
                    Ok(Content::NeedMore(State::Body(method, header, buf)))
                } else {
                    Err(Error::FrameUnexpected)
                }
            }
            State::Start(_) => Err(Error::FrameUnexpected),
        }
    }
}
