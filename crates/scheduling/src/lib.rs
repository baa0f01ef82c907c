//! Appointment scheduling aggregate.

pub mod appointment;

pub use appointment::{
    Appointment, AppointmentCommand, AppointmentEvent, AppointmentId, AppointmentStage,
    CancelAppointmentByPatient, CancelAppointmentByPractice, ConfirmAppointment,
    MarkAppointmentNoShow, RequestAppointment, RescheduleAppointment,
};
