use plexus_storage::StoreError;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid subject")]
    SubjectInvalid,

    #[error("published subject does not match stream")]
    SubjectMismatch,

    #[error("subjects overlap with an existing stream")]
    SubjectsOverlap,

    #[error("invalid stream name")]
    StreamNameInvalid,

    #[error("stream not found")]
    StreamNotFound,

    #[error("stream already exists")]
    StreamAlreadyExists,

    #[error("consumer not found")]
    ConsumerNotFound,

    #[error("consumer already exists")]
    ConsumerAlreadyExists,

    #[error("template not found")]
    TemplateNotFound,

    #[error("template name already in use")]
    TemplateAlreadyExists,

    #[error("message size exceeds maximum allowed")]
    MessageTooLarge,

    #[error("maximum messages exceeded")]
    MaxMessagesExceeded,

    #[error("maximum bytes exceeded")]
    MaxBytesExceeded,

    #[error("maximum consumers limit reached")]
    MaxConsumersExceeded,

    #[error("maximum number of streams reached")]
    MaxStreamsExceeded,

    #[error("resource limits exceeded for account")]
    AccountResourceExhausted,

    #[error("consumer config invalid: {0}")]
    ConsumerConfigInvalid(String),

    #[error("consumer requires interest for delivery subject when ephemeral")]
    DeliverSubjectNotInterest,

    #[error("message not found")]
    MessageNotFound,

    #[error("stream configuration update can not change {0}")]
    UpdateImmutable(&'static str),

    #[error("replicas setting of {0} not supported")]
    ReplicasUnsupported(i32),

    #[error("restore subscription closed")]
    RestoreSubscriptionClosed,

    #[error("{0}")]
    BadRequest(String),

    #[error("no response from transport")]
    NoResponders,

    #[error("channel closed")]
    ChannelClosed,

    #[error("storage error: {0}")]
    Store(StoreError),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => Error::MessageNotFound,
            other => Error::Store(other),
        }
    }
}

impl Error {
    /// HTTP-style code used in management API error responses.
    pub fn api_code(&self) -> u16 {
        match self {
            Error::StreamNotFound
            | Error::ConsumerNotFound
            | Error::TemplateNotFound
            | Error::MessageNotFound => 404,

            Error::SubjectInvalid
            | Error::SubjectMismatch
            | Error::SubjectsOverlap
            | Error::StreamNameInvalid
            | Error::StreamAlreadyExists
            | Error::ConsumerAlreadyExists
            | Error::TemplateAlreadyExists
            | Error::MessageTooLarge
            | Error::MaxMessagesExceeded
            | Error::MaxBytesExceeded
            | Error::MaxConsumersExceeded
            | Error::MaxStreamsExceeded
            | Error::AccountResourceExhausted
            | Error::ConsumerConfigInvalid(_)
            | Error::DeliverSubjectNotInterest
            | Error::UpdateImmutable(_)
            | Error::ReplicasUnsupported(_)
            | Error::RestoreSubscriptionClosed
            | Error::BadRequest(_)
            | Error::Json(_) => 400,

            Error::NoResponders | Error::ChannelClosed | Error::Store(_) => 500,
        }
    }
}
